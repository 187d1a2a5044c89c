//! Primary error type for FrankenGalera operations.
//!
//! Recoverable conditions surface through [`GaleraError`] variants; a
//! certification FAILED verdict is a *value*, never an error. Violated
//! internal invariants (index corruption, out-of-order release of an
//! assigned seqno) panic instead — they indicate a bug, not a condition the
//! caller can handle.

use std::path::PathBuf;

use thiserror::Error;

/// Primary error type.
#[derive(Error, Debug)]
pub enum GaleraError {
    // === Protocol errors ===
    /// Unsupported serialization version.
    #[error("unsupported {what} version: {version}")]
    UnsupportedVersion { what: &'static str, version: u32 },

    /// Frame or section shorter than its declared contents.
    #[error("buffer too short: expected {expected} bytes, got {actual}")]
    BufferTooShort { expected: usize, actual: usize },

    /// Malformed frame contents (bad magic, bad flag bits, bad prefix).
    #[error("malformed {what}: {detail}")]
    Malformed { what: &'static str, detail: String },

    /// Checksum mismatch on an untrusted (freshly received) buffer.
    #[error("checksum mismatch on {what}: computed {computed:#010x}, stored {stored:#010x}")]
    ChecksumMismatch {
        what: &'static str,
        computed: u32,
        stored: u32,
    },

    /// Fragment arrived out of the strict `(action, fragment)` order.
    #[error(
        "unordered fragment: expected {expected_action}:{expected_frag}, \
         received {action}:{frag}"
    )]
    UnorderedFragment {
        expected_action: u64,
        expected_frag: u32,
        action: u64,
        frag: u32,
    },

    // === Transient conditions ===
    /// Temporary failure (allocation pressure, flow control, no quorum).
    #[error("temporarily unavailable: {0}")]
    TryAgain(String),

    /// Operation interrupted by a concurrent abort.
    #[error("operation interrupted")]
    Interrupted,

    /// Operation timed out.
    #[error("operation timed out")]
    TimedOut,

    // === Connectivity ===
    /// Node is not in a primary component.
    #[error("not in primary component")]
    NotConnected,

    /// Provider was closed while the operation was pending.
    #[error("connection aborted")]
    ConnectionAborted,

    /// Operation on an uninitialized component.
    #[error("not initialized")]
    NotInitialized,

    // === State transfer ===
    /// No suitable snapshot donor.
    #[error("no donor available")]
    NoDonor,

    /// Selected donor is unreachable.
    #[error("donor unreachable")]
    DonorUnreachable,

    /// Donor and joiner are the same node.
    #[error("donor and joiner are the same node")]
    DonorIsJoiner,

    // === Cache ===
    /// Buffer handle does not name a live cache buffer.
    #[error("unknown cache buffer handle: {handle:#x}")]
    UnknownBuffer { handle: u64 },

    /// Requested seqno is not (or no longer) in the cache.
    #[error("seqno {seqno} not found in cache")]
    SeqnoNotFound { seqno: i64 },

    /// Cache cannot satisfy the allocation.
    #[error("cache allocation of {size} bytes failed")]
    AllocationFailed { size: usize },

    /// The encryption callback reported failure.
    #[error("encryption callback failed: {detail}")]
    EncryptionFailed { detail: String },

    /// Cannot open or map a cache file.
    #[error("cannot open cache file: '{path}'")]
    CannotOpen { path: PathBuf },

    /// File I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errno-style result codes surfaced at the provider boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum ResultCode {
    /// Success.
    Ok = 0,
    /// EPROTO: protocol violation, offending source may be dropped.
    ProtocolError = 71,
    /// EAGAIN: temporary, retry.
    TryAgain = 11,
    /// EINTR: interrupted.
    Interrupted = 4,
    /// ETIMEDOUT.
    TimedOut = 110,
    /// ENOTCONN: not in primary component.
    NotConnected = 107,
    /// EPERM: operation not permitted outside primary component.
    PermissionDenied = 1,
    /// ECONNABORTED: provider closed.
    ConnectionAborted = 103,
    /// EBADF: uninitialized.
    NotInitialized = 9,
    /// EHOSTUNREACH: donor unavailable.
    HostUnreachable = 113,
    /// EHOSTDOWN: donor == joiner.
    HostDown = 112,
    /// EIO: I/O or cache failure.
    Io = 5,
}

impl GaleraError {
    /// Map to the errno-style code reported to callers.
    #[must_use]
    pub const fn result_code(&self) -> ResultCode {
        match self {
            Self::UnsupportedVersion { .. }
            | Self::BufferTooShort { .. }
            | Self::Malformed { .. }
            | Self::ChecksumMismatch { .. }
            | Self::UnorderedFragment { .. } => ResultCode::ProtocolError,
            Self::TryAgain(_) | Self::NoDonor => ResultCode::TryAgain,
            Self::Interrupted => ResultCode::Interrupted,
            Self::TimedOut => ResultCode::TimedOut,
            Self::NotConnected => ResultCode::NotConnected,
            Self::ConnectionAborted => ResultCode::ConnectionAborted,
            Self::NotInitialized => ResultCode::NotInitialized,
            Self::DonorUnreachable => ResultCode::HostUnreachable,
            Self::DonorIsJoiner => ResultCode::HostDown,
            Self::UnknownBuffer { .. }
            | Self::SeqnoNotFound { .. }
            | Self::AllocationFailed { .. }
            | Self::EncryptionFailed { .. }
            | Self::CannotOpen { .. }
            | Self::Io(_) => ResultCode::Io,
        }
    }

    /// Whether a retry may succeed without any other change.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::TryAgain(_) | Self::TimedOut | Self::NoDonor | Self::AllocationFailed { .. }
        )
    }

    /// Whether the error indicates a peer protocol violation.
    #[must_use]
    pub const fn is_protocol(&self) -> bool {
        matches!(self.result_code(), ResultCode::ProtocolError)
    }

    /// Construct a malformed-frame error.
    pub fn malformed(what: &'static str, detail: impl Into<String>) -> Self {
        Self::Malformed {
            what,
            detail: detail.into(),
        }
    }

    /// Construct a transient error.
    pub fn try_again(detail: impl Into<String>) -> Self {
        Self::TryAgain(detail.into())
    }
}

/// Result type alias using [`GaleraError`].
pub type Result<T> = std::result::Result<T, GaleraError>;

/// Bounds-checked length guard for frame decoding.
pub fn ensure_len(buf: &[u8], need: usize) -> Result<()> {
    if buf.len() < need {
        Err(GaleraError::BufferTooShort {
            expected: need,
            actual: buf.len(),
        })
    } else {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display() {
        let err = GaleraError::UnsupportedVersion {
            what: "write-set",
            version: 9,
        };
        assert_eq!(err.to_string(), "unsupported write-set version: 9");

        let err = GaleraError::UnorderedFragment {
            expected_action: 7,
            expected_frag: 2,
            action: 7,
            frag: 4,
        };
        assert_eq!(
            err.to_string(),
            "unordered fragment: expected 7:2, received 7:4"
        );
    }

    #[test]
    fn result_code_mapping() {
        assert_eq!(
            GaleraError::malformed("key part", "bad prefix").result_code(),
            ResultCode::ProtocolError
        );
        assert_eq!(
            GaleraError::try_again("flow control").result_code(),
            ResultCode::TryAgain
        );
        assert_eq!(
            GaleraError::Interrupted.result_code(),
            ResultCode::Interrupted
        );
        assert_eq!(
            GaleraError::DonorIsJoiner.result_code(),
            ResultCode::HostDown
        );
        assert_eq!(
            GaleraError::SeqnoNotFound { seqno: 3 }.result_code(),
            ResultCode::Io
        );
    }

    #[test]
    fn transient_classification() {
        assert!(GaleraError::try_again("x").is_transient());
        assert!(GaleraError::AllocationFailed { size: 1 }.is_transient());
        assert!(!GaleraError::NotConnected.is_transient());
        assert!(!GaleraError::Interrupted.is_transient());
    }

    #[test]
    fn ensure_len_guard() {
        assert!(ensure_len(&[0u8; 4], 4).is_ok());
        let err = ensure_len(&[0u8; 3], 4).unwrap_err();
        assert!(matches!(
            err,
            GaleraError::BufferTooShort {
                expected: 4,
                actual: 3
            }
        ));
    }

    #[test]
    fn io_error_from() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "missing");
        let err: GaleraError = io.into();
        assert_eq!(err.result_code(), ResultCode::Io);
    }
}
