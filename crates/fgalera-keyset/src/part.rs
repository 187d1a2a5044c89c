//! Key-part wire codec.
//!
//! A serialized part is `{1B prefix, 1B version, hash, [annotation]}`. The
//! hash is 8 bytes for the FLAT8 family and 16 bytes for the FLAT16 family;
//! annotated ("A") versions append a length-prefixed, zero-padded annotation
//! block aligned to [`ANNOTATION_ALIGNMENT`].

use fgalera_error::{ensure_len, GaleraError, Result};
use fgalera_types::KeyStrength;
use xxhash_rust::xxh3::{xxh3_128, Xxh3};

/// Alignment of annotation blocks and of the gathered key section.
pub const ANNOTATION_ALIGNMENT: usize = 8;

/// Largest annotation block representable (`u16` length prefix, aligned).
const MAX_ANNOTATION: usize = (u16::MAX as usize / ANNOTATION_ALIGNMENT) * ANNOTATION_ALIGNMENT;

/// Largest single annotated part length representable in one byte.
const MAX_ANNOTATED_PART: usize = u8::MAX as usize;

/// Serialization version of a key set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum KeySetVersion {
    /// No keys at all.
    Empty = 0,
    /// 8-byte hashes.
    Flat8 = 1,
    /// 8-byte hashes with annotations.
    Flat8A = 2,
    /// 16-byte hashes.
    Flat16 = 3,
    /// 16-byte hashes with annotations.
    Flat16A = 4,
}

impl KeySetVersion {
    /// Decode the version byte.
    #[must_use]
    pub const fn from_byte(b: u8) -> Option<Self> {
        match b {
            0 => Some(Self::Empty),
            1 => Some(Self::Flat8),
            2 => Some(Self::Flat8A),
            3 => Some(Self::Flat16),
            4 => Some(Self::Flat16A),
            _ => None,
        }
    }

    /// The key-set version used by a given write-set protocol version.
    ///
    /// v3 and v4 write-sets carry 8-byte hashes, v5 carries 16-byte hashes;
    /// `annotated` selects the "A" variant.
    pub fn for_ws_version(ws_version: u8, annotated: bool) -> Result<Self> {
        match ws_version {
            3 | 4 => Ok(if annotated { Self::Flat8A } else { Self::Flat8 }),
            5 => Ok(if annotated { Self::Flat16A } else { Self::Flat16 }),
            v => Err(GaleraError::UnsupportedVersion {
                what: "key set",
                version: u32::from(v),
            }),
        }
    }

    /// Hash width in bytes.
    #[must_use]
    pub const fn hash_size(self) -> usize {
        match self {
            Self::Empty => 0,
            Self::Flat8 | Self::Flat8A => 8,
            Self::Flat16 | Self::Flat16A => 16,
        }
    }

    /// Whether parts carry an annotation block.
    #[must_use]
    pub const fn annotated(self) -> bool {
        matches!(self, Self::Flat8A | Self::Flat16A)
    }

    /// Fixed part size excluding the annotation block.
    #[must_use]
    pub const fn base_part_size(self) -> usize {
        2 + self.hash_size()
    }
}

/// Full-width key-part fingerprint.
///
/// FLAT8-class sets only carry (and only compare) the low 8 bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct KeyFingerprint(pub u128);

impl KeyFingerprint {
    /// Fingerprint of the empty (zero-level) key path.
    #[must_use]
    pub fn root() -> Self {
        Self(xxh3_128(&[]))
    }

    /// Derive the child fingerprint state for one more part.
    ///
    /// The incremental state is an XXH3 streaming hasher fed with
    /// `len_le32 || bytes` for every part along the path.
    #[must_use]
    pub fn digest(hasher: &Xxh3) -> Self {
        Self(hasher.digest128())
    }

    /// Truncate to the width carried by `version`, so that FLAT8 and FLAT16
    /// encodings of the same path compare correctly against their own kind.
    #[must_use]
    pub const fn truncate(self, version: KeySetVersion) -> Self {
        match version.hash_size() {
            8 => Self(self.0 & 0xffff_ffff_ffff_ffff),
            _ => self,
        }
    }

    /// Wire bytes at the given width.
    #[must_use]
    pub fn to_wire(self, version: KeySetVersion) -> [u8; 16] {
        let mut out = [0u8; 16];
        let bytes = self.0.to_le_bytes();
        out[..version.hash_size()].copy_from_slice(&bytes[..version.hash_size()]);
        out
    }
}

/// Feed one part into an incremental path hasher.
pub fn hash_append(hasher: &mut Xxh3, part: &[u8]) {
    let len = u32::try_from(part.len()).unwrap_or(u32::MAX);
    hasher.update(&len.to_le_bytes());
    hasher.update(part);
}

/// Serialize one part into `out`.
///
/// `raw_parts` is the original key path up to and including this part; it is
/// only consulted for annotated versions.
pub fn store_part(
    out: &mut Vec<u8>,
    version: KeySetVersion,
    prefix: KeyStrength,
    fingerprint: KeyFingerprint,
    raw_parts: &[&[u8]],
) {
    out.push(prefix as u8);
    out.push(version as u8);
    let wire = fingerprint.to_wire(version);
    out.extend_from_slice(&wire[..version.hash_size()]);
    if version.annotated() {
        store_annotation(out, raw_parts);
    }
}

/// Serialize the annotation block: `u16` total length (self-inclusive),
/// then `1B len || bytes` per path part, zero-padded to the alignment.
fn store_annotation(out: &mut Vec<u8>, raw_parts: &[&[u8]]) {
    let mut body_size = 2usize;
    for part in raw_parts {
        body_size += 1 + part.len().min(MAX_ANNOTATED_PART);
    }
    let ann_size = align_up(body_size).min(MAX_ANNOTATION);

    let start = out.len();
    out.extend_from_slice(
        &u16::try_from(ann_size)
            .expect("annotation size bounded by MAX_ANNOTATION")
            .to_le_bytes(),
    );
    for part in raw_parts {
        let left = ann_size - (out.len() - start);
        if left <= 1 {
            break;
        }
        let part_len = part.len().min(MAX_ANNOTATED_PART).min(left - 1);
        out.push(u8::try_from(part_len).expect("part_len <= u8::MAX"));
        out.extend_from_slice(&part[..part_len]);
    }
    let written = out.len() - start;
    out.resize(start + ann_size.max(written), 0);
    debug_assert_eq!((out.len() - start) % ANNOTATION_ALIGNMENT, 0);
}

/// Round up to the annotation alignment.
#[must_use]
pub const fn align_up(n: usize) -> usize {
    (n + ANNOTATION_ALIGNMENT - 1) / ANNOTATION_ALIGNMENT * ANNOTATION_ALIGNMENT
}

/// Decoded view of one serialized key part.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyPartView {
    /// Strength prefix as stored.
    pub prefix: KeyStrength,
    /// Serialization version of this part.
    pub version: KeySetVersion,
    /// Full-width fingerprint (zero-extended for 8-byte versions).
    pub fingerprint: KeyFingerprint,
    /// Raw annotation block, empty for non-annotated versions.
    pub annotation: Vec<u8>,
}

impl KeyPartView {
    /// Decode one part from the head of `buf`; returns the view and the
    /// number of bytes consumed.
    pub fn decode(buf: &[u8]) -> Result<(Self, usize)> {
        ensure_len(buf, 2)?;
        let prefix = KeyStrength::from_byte(buf[0]).ok_or_else(|| {
            GaleraError::malformed("key part", format!("unsupported prefix {}", buf[0]))
        })?;
        let version = KeySetVersion::from_byte(buf[1]).ok_or_else(|| {
            GaleraError::malformed("key part", format!("unsupported version {}", buf[1]))
        })?;
        if version == KeySetVersion::Empty {
            return Err(GaleraError::malformed("key part", "EMPTY version in part"));
        }

        let base = version.base_part_size();
        ensure_len(buf, base)?;
        let mut hash = [0u8; 16];
        hash[..version.hash_size()].copy_from_slice(&buf[2..base]);
        let fingerprint = KeyFingerprint(u128::from_le_bytes(hash));

        let mut consumed = base;
        let mut annotation = Vec::new();
        if version.annotated() {
            ensure_len(buf, base + 2)?;
            let ann_size = usize::from(u16::from_le_bytes([buf[base], buf[base + 1]]));
            if ann_size < 2 || ann_size % ANNOTATION_ALIGNMENT != 0 {
                return Err(GaleraError::malformed(
                    "key part",
                    format!("bad annotation size {ann_size}"),
                ));
            }
            ensure_len(buf, base + ann_size)?;
            annotation = buf[base..base + ann_size].to_vec();
            consumed += ann_size;
        }

        Ok((
            Self {
                prefix,
                version,
                fingerprint,
                annotation,
            },
            consumed,
        ))
    }

    /// Render the annotated key path, if any, for debug output.
    #[must_use]
    pub fn annotation_parts(&self) -> Vec<Vec<u8>> {
        let mut parts = Vec::new();
        if self.annotation.len() < 2 {
            return parts;
        }
        let ann_size = usize::from(u16::from_le_bytes([self.annotation[0], self.annotation[1]]))
            .min(self.annotation.len());
        let mut off = 2;
        while off < ann_size {
            let len = usize::from(self.annotation[off]);
            off += 1;
            if len == 0 || off + len > ann_size {
                break;
            }
            parts.push(self.annotation[off..off + len].to_vec());
            off += len;
        }
        parts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fingerprint_of(parts: &[&[u8]]) -> KeyFingerprint {
        let mut h = Xxh3::new();
        for p in parts {
            hash_append(&mut h, p);
        }
        KeyFingerprint::digest(&h)
    }

    #[test]
    fn version_mapping() {
        assert_eq!(
            KeySetVersion::for_ws_version(3, false).unwrap(),
            KeySetVersion::Flat8
        );
        assert_eq!(
            KeySetVersion::for_ws_version(4, true).unwrap(),
            KeySetVersion::Flat8A
        );
        assert_eq!(
            KeySetVersion::for_ws_version(5, true).unwrap(),
            KeySetVersion::Flat16A
        );
        assert!(KeySetVersion::for_ws_version(6, false).is_err());
    }

    #[test]
    fn flat16_part_round_trip() {
        let fp = fingerprint_of(&[b"b", b"l"]);
        let mut buf = Vec::new();
        store_part(
            &mut buf,
            KeySetVersion::Flat16,
            KeyStrength::Exclusive,
            fp,
            &[b"b", b"l"],
        );
        assert_eq!(buf.len(), 18);

        let (view, used) = KeyPartView::decode(&buf).unwrap();
        assert_eq!(used, 18);
        assert_eq!(view.prefix, KeyStrength::Exclusive);
        assert_eq!(view.version, KeySetVersion::Flat16);
        assert_eq!(view.fingerprint, fp);
        assert!(view.annotation.is_empty());
    }

    #[test]
    fn flat8_truncates_fingerprint() {
        let fp = fingerprint_of(&[b"key"]);
        let mut buf = Vec::new();
        store_part(&mut buf, KeySetVersion::Flat8, KeyStrength::Shared, fp, &[]);
        assert_eq!(buf.len(), 10);
        let (view, _) = KeyPartView::decode(&buf).unwrap();
        assert_eq!(view.fingerprint, fp.truncate(KeySetVersion::Flat8));
        assert_eq!(view.fingerprint.0 >> 64, 0);
    }

    #[test]
    fn annotated_part_is_aligned_and_readable() {
        let path: &[&[u8]] = &[b"base", b"leafvalue"];
        let fp = fingerprint_of(path);
        let mut buf = Vec::new();
        store_part(
            &mut buf,
            KeySetVersion::Flat16A,
            KeyStrength::Update,
            fp,
            path,
        );
        // 18 fixed + annotation (2 + 5 + 10 = 17, aligned to 24)
        assert_eq!(buf.len(), 18 + 24);

        let (view, used) = KeyPartView::decode(&buf).unwrap();
        assert_eq!(used, buf.len());
        assert_eq!(
            view.annotation_parts(),
            vec![b"base".to_vec(), b"leafvalue".to_vec()]
        );
    }

    #[test]
    fn byte_exact_flat16a_output() {
        // Two independent encodings of the same path must be bit-identical.
        let path: &[&[u8]] = &[b"db", b"table", b"row7"];
        let fp = fingerprint_of(path);
        let mut a = Vec::new();
        let mut b = Vec::new();
        store_part(&mut a, KeySetVersion::Flat16A, KeyStrength::Exclusive, fp, path);
        store_part(&mut b, KeySetVersion::Flat16A, KeyStrength::Exclusive, fp, path);
        assert_eq!(a, b);
    }

    #[test]
    fn decode_rejects_garbage() {
        assert!(KeyPartView::decode(&[9, 1, 0, 0, 0, 0, 0, 0, 0, 0]).is_err());
        assert!(KeyPartView::decode(&[0, 9]).is_err());
        assert!(KeyPartView::decode(&[0, 3, 1, 2]).is_err()); // short hash
    }

    #[test]
    fn empty_path_hashes_to_root() {
        assert_eq!(fingerprint_of(&[]), KeyFingerprint::root());
    }
}
