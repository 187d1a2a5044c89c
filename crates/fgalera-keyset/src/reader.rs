//! Key-set reader.
//!
//! Parses the section produced by [`crate::KeySetOut::gather`]: an 8-byte
//! header `{version, reserved, part count, CRC}` followed by serialized
//! parts. The CRC covers the (padded) part bytes and is verified up front so
//! iteration itself only has to bounds-check.

use fgalera_error::{ensure_len, GaleraError, Result};

use crate::part::{KeyPartView, KeySetVersion};
use crate::SECTION_HEADER_SIZE;

/// Iterator over the parts of a serialized key section.
#[derive(Debug)]
pub struct KeySetIn<'a> {
    version: KeySetVersion,
    count: usize,
    body: &'a [u8],
    offset: usize,
    yielded: usize,
}

impl<'a> KeySetIn<'a> {
    /// Parse and verify the section header.
    pub fn init(buf: &'a [u8]) -> Result<Self> {
        ensure_len(buf, SECTION_HEADER_SIZE)?;
        let version = KeySetVersion::from_byte(buf[0]).ok_or(GaleraError::UnsupportedVersion {
            what: "key set",
            version: u32::from(buf[0]),
        })?;
        let count = usize::from(u16::from_le_bytes([buf[2], buf[3]]));
        let stored_crc = u32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]);

        let body = &buf[SECTION_HEADER_SIZE..];
        let computed = crc32c::crc32c(body);
        if computed != stored_crc {
            return Err(GaleraError::ChecksumMismatch {
                what: "key set",
                computed,
                stored: stored_crc,
            });
        }

        if version == KeySetVersion::Empty && count != 0 {
            return Err(GaleraError::malformed("key set", "EMPTY set with parts"));
        }

        Ok(Self {
            version,
            count,
            body,
            offset: 0,
            yielded: 0,
        })
    }

    /// Declared number of parts.
    #[must_use]
    pub fn count(&self) -> usize {
        self.count
    }

    /// Section serialization version.
    #[must_use]
    pub fn version(&self) -> KeySetVersion {
        self.version
    }

    fn next_part(&mut self) -> Result<KeyPartView> {
        let (view, used) = KeyPartView::decode(&self.body[self.offset..])?;
        if view.version.hash_size() != self.version.hash_size() {
            return Err(GaleraError::malformed(
                "key part",
                format!(
                    "part version {:?} inside {:?} section",
                    view.version, self.version
                ),
            ));
        }
        self.offset += used;
        self.yielded += 1;
        Ok(view)
    }
}

impl Iterator for KeySetIn<'_> {
    type Item = Result<KeyPartView>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.yielded >= self.count {
            return None;
        }
        Some(self.next_part())
    }
}
