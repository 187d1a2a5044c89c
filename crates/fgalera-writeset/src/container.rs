//! Write-set container codec.
//!
//! Wire layout (little-endian), versions 3–5:
//!
//! ```text
//! Offset  Size  Field
//!   0       3   magic "FGW"
//!   3       1   version (3..=5)
//!   4       1   type (write-set / conf-change / sync)
//!   5       1   flags
//!   6       2   reserved (zero)
//!   8      16   source node id
//!  24       8   connection id
//!  32       8   transaction id
//!  40       8   last-seen global seqno
//!  48       2   pa-range (zero below v5)
//!  50       2   reserved (zero)
//!  52       4   key section length
//!  56       4   data section length
//!  60       4   annotation length
//!  64       —   key section | data | annotation
//!          [pad to 8 at v5]
//!           4   CRC32C of everything above
//! ```

use fgalera_error::{ensure_len, GaleraError, Result};
use fgalera_gcache::{BufferId, GCache};
use fgalera_keyset::{AppendOutcome, KeyData, KeyPartView, KeySetIn, KeySetOut, KeySetVersion};
use fgalera_types::{ActionType, ConnId, NodeId, Seqno, TrxId, WsFlags, WS_VERSION_MAX, WS_VERSION_MIN};

/// Serialized header size.
pub const HEADER_SIZE: usize = 64;

/// Magic bytes opening every write-set.
pub const MAGIC: [u8; 3] = *b"FGW";

const CRC_SIZE: usize = 4;

fn pad_to(len: usize, version: u8) -> usize {
    if version >= 5 {
        (len + 7) / 8 * 8
    } else {
        len
    }
}

/// Scatter list whose concatenation is the wire form of one write-set.
#[derive(Debug, Clone)]
pub struct GatherVec {
    segments: Vec<Vec<u8>>,
}

impl GatherVec {
    /// Total serialized size.
    #[must_use]
    pub fn size(&self) -> usize {
        self.segments.iter().map(Vec::len).sum()
    }

    /// Borrow the segments.
    #[must_use]
    pub fn segments(&self) -> &[Vec<u8>] {
        &self.segments
    }

    /// Stamp the last-seen ordinal used by certification and recompute the
    /// trailer. Must be called before the bytes leave the node.
    pub fn finalize(&mut self, last_seen: Seqno) {
        self.segments[0][40..48].copy_from_slice(&last_seen.get().to_le_bytes());
        self.recompute_trailer();
    }

    /// Write the concatenated form into `dst`; returns bytes written.
    pub fn serialize(&self, dst: &mut [u8]) -> Result<usize> {
        let total = self.size();
        ensure_len(dst, total)?;
        let mut off = 0;
        for seg in &self.segments {
            dst[off..off + seg.len()].copy_from_slice(seg);
            off += seg.len();
        }
        Ok(total)
    }

    fn recompute_trailer(&mut self) {
        let last = self.segments.len() - 1;
        let mut crc = 0u32;
        for seg in &self.segments[..last] {
            crc = crc32c::crc32c_append(crc, seg);
        }
        let trailer = self.segments[last]
            .len()
            .checked_sub(CRC_SIZE)
            .expect("trailer segment carries the CRC");
        crc = crc32c::crc32c_append(crc, &self.segments[last][..trailer]);
        let at = self.segments[last].len() - CRC_SIZE;
        self.segments[last][at..].copy_from_slice(&crc.to_le_bytes());
    }
}

/// Write-set under construction on the originating node.
#[derive(Debug)]
pub struct WriteSetOut {
    version: u8,
    ws_type: ActionType,
    flags: WsFlags,
    keys: KeySetOut,
    data: Vec<u8>,
    annotation: Vec<u8>,
    pa_range: u16,
}

impl WriteSetOut {
    /// Start a write-set at the given protocol version.
    pub fn new(version: u8, flags: WsFlags) -> Result<Self> {
        if !(WS_VERSION_MIN..=WS_VERSION_MAX).contains(&version) {
            return Err(GaleraError::UnsupportedVersion {
                what: "write-set",
                version: u32::from(version),
            });
        }
        Ok(Self {
            version,
            ws_type: ActionType::WriteSet,
            flags,
            keys: KeySetOut::new(KeySetVersion::for_ws_version(version, true)?, version),
            data: Vec::new(),
            annotation: Vec::new(),
            pa_range: 0,
        })
    }

    /// Protocol version.
    #[must_use]
    pub fn version(&self) -> u8 {
        self.version
    }

    /// Append one key to the key section.
    pub fn append_key(&mut self, kd: &KeyData<'_>) -> AppendOutcome {
        self.keys.append(kd)
    }

    /// Append payload bytes for the database service.
    pub fn append_data(&mut self, bytes: &[u8]) {
        self.data.extend_from_slice(bytes);
    }

    /// Append annotation (debug/provenance) bytes.
    pub fn append_annotation(&mut self, bytes: &[u8]) {
        self.annotation.extend_from_slice(bytes);
    }

    /// Replace the flag word.
    pub fn set_flags(&mut self, flags: WsFlags) {
        self.flags = flags;
    }

    /// Current flags.
    #[must_use]
    pub fn flags(&self) -> WsFlags {
        self.flags
    }

    /// Set the parallel-apply range hint (v5).
    pub fn set_pa_range(&mut self, range: u16) {
        self.pa_range = range;
    }

    /// Number of stored key parts.
    #[must_use]
    pub fn key_count(&self) -> usize {
        self.keys.count()
    }

    /// Produce the scatter list. The last-seen field is zero until
    /// [`GatherVec::finalize`] stamps it.
    #[must_use]
    pub fn gather(&self, source: NodeId, conn: ConnId, trx: TrxId) -> GatherVec {
        let keys = self.keys.gather();

        let mut header = vec![0u8; HEADER_SIZE];
        header[..3].copy_from_slice(&MAGIC);
        header[3] = self.version;
        header[4] = self.ws_type.as_byte();
        header[5] = u8::try_from(self.flags.bits()).expect("flag bits fit one byte");
        header[8..24].copy_from_slice(source.as_bytes());
        header[24..32].copy_from_slice(&conn.get().to_le_bytes());
        header[32..40].copy_from_slice(&trx.get().to_le_bytes());
        // last_seen at 40..48 stays zero until finalize().
        let pa_range = if self.version >= 5 { self.pa_range } else { 0 };
        header[48..50].copy_from_slice(&pa_range.to_le_bytes());
        header[52..56].copy_from_slice(
            &u32::try_from(keys.len()).expect("key section fits u32").to_le_bytes(),
        );
        header[56..60].copy_from_slice(
            &u32::try_from(self.data.len()).expect("data section fits u32").to_le_bytes(),
        );
        header[60..64].copy_from_slice(
            &u32::try_from(self.annotation.len())
                .expect("annotation fits u32")
                .to_le_bytes(),
        );

        let body_len = HEADER_SIZE + keys.len() + self.data.len() + self.annotation.len();
        let padded = pad_to(body_len, self.version);
        let tail = vec![0u8; padded - body_len + CRC_SIZE];

        let mut gv = GatherVec {
            segments: vec![
                header,
                keys,
                self.data.clone(),
                self.annotation.clone(),
                tail,
            ],
        };
        gv.recompute_trailer();
        gv
    }
}

/// Parsed, CRC-verified write-set on the delivery path.
#[derive(Debug, Clone)]
pub struct WriteSetIn {
    /// Protocol version.
    pub version: u8,
    /// Action type.
    pub ws_type: ActionType,
    /// Flag word.
    pub flags: WsFlags,
    /// Originating node.
    pub source: NodeId,
    /// Connection id on the source.
    pub conn_id: ConnId,
    /// Transaction id on the source.
    pub trx_id: TrxId,
    /// Last seqno the source had seen when the write-set left it.
    pub last_seen: Seqno,
    /// Parallel-apply range hint.
    pub pa_range: u16,
    /// Decoded key parts.
    pub keys: Vec<KeyPartView>,
    /// Opaque payload for the database service.
    pub data: Vec<u8>,
    /// Annotation bytes.
    pub annotation: Vec<u8>,
    /// Total serialized size.
    pub size: usize,
}

impl WriteSetIn {
    /// Parse from wire bytes, verifying magic, version, flags, and CRC.
    pub fn parse(buf: &[u8]) -> Result<Self> {
        ensure_len(buf, HEADER_SIZE + CRC_SIZE)?;
        if buf[..3] != MAGIC {
            return Err(GaleraError::malformed("write-set", "bad magic"));
        }
        let version = buf[3];
        if !(WS_VERSION_MIN..=WS_VERSION_MAX).contains(&version) {
            return Err(GaleraError::UnsupportedVersion {
                what: "write-set",
                version: u32::from(version),
            });
        }
        let ws_type = ActionType::from_byte(buf[4])
            .ok_or_else(|| GaleraError::malformed("write-set", format!("bad type {}", buf[4])))?;
        let flags = WsFlags::from_bits(u16::from(buf[5]))
            .ok_or_else(|| GaleraError::malformed("write-set", format!("bad flags {:#x}", buf[5])))?;

        let mut source = [0u8; 16];
        source.copy_from_slice(&buf[8..24]);
        let conn_id = ConnId(u64::from_le_bytes(buf[24..32].try_into().expect("8 bytes")));
        let trx_id = TrxId(u64::from_le_bytes(buf[32..40].try_into().expect("8 bytes")));
        let last_seen = Seqno(i64::from_le_bytes(buf[40..48].try_into().expect("8 bytes")));
        let pa_range = u16::from_le_bytes([buf[48], buf[49]]);

        let keys_len = u32::from_le_bytes(buf[52..56].try_into().expect("4 bytes")) as usize;
        let data_len = u32::from_le_bytes(buf[56..60].try_into().expect("4 bytes")) as usize;
        let ann_len = u32::from_le_bytes(buf[60..64].try_into().expect("4 bytes")) as usize;

        let body_len = HEADER_SIZE + keys_len + data_len + ann_len;
        let total = pad_to(body_len, version) + CRC_SIZE;
        ensure_len(buf, total)?;

        let stored = u32::from_le_bytes(
            buf[total - CRC_SIZE..total].try_into().expect("4 bytes"),
        );
        let computed = crc32c::crc32c(&buf[..total - CRC_SIZE]);
        if computed != stored {
            return Err(GaleraError::ChecksumMismatch {
                what: "write-set",
                computed,
                stored,
            });
        }

        let keys_at = HEADER_SIZE;
        let data_at = keys_at + keys_len;
        let ann_at = data_at + data_len;

        let keys = if keys_len == 0 {
            Vec::new()
        } else {
            KeySetIn::init(&buf[keys_at..data_at])?.collect::<Result<Vec<_>>>()?
        };

        Ok(Self {
            version,
            ws_type,
            flags,
            source: NodeId::from_bytes(source),
            conn_id,
            trx_id,
            last_seen,
            pa_range,
            keys,
            data: buf[data_at..ann_at].to_vec(),
            annotation: buf[ann_at..ann_at + ann_len].to_vec(),
            size: total,
        })
    }

    /// Parse straight out of a cache buffer's plaintext view.
    pub fn unserialize(cache: &GCache, id: BufferId, size: usize) -> Result<Self> {
        let plain = cache.get_ro_plaintext(id)?;
        let bytes = plain.read();
        ensure_len(&bytes, size)?;
        Self::parse(&bytes[..size])
    }

    /// Total-order-isolated write-set.
    #[must_use]
    pub fn is_toi(&self) -> bool {
        self.flags.is_toi()
    }

    /// Opening half of a non-blocking operation.
    #[must_use]
    pub fn is_nbo_begin(&self) -> bool {
        self.flags.is_nbo_begin()
    }

    /// Closing half of a non-blocking operation.
    #[must_use]
    pub fn is_nbo_end(&self) -> bool {
        self.flags.is_nbo_end()
    }

    /// Must be applied strictly serially.
    #[must_use]
    pub fn is_pa_unsafe(&self) -> bool {
        self.flags.contains(WsFlags::PA_UNSAFE)
    }
}
