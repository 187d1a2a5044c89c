//! Typed configuration surface.
//!
//! Parameters keep their historical dotted string names so existing option
//! files keep working. Sizes accept `K`/`M`/`G` suffixes (powers of 1024).

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Ring-buffer file name parameter.
pub const PARAM_CACHE_NAME: &str = "gcache.name";
/// Ring-buffer size parameter.
pub const PARAM_CACHE_SIZE: &str = "gcache.size";
/// Heap-store budget parameter.
pub const PARAM_MEM_SIZE: &str = "gcache.mem_size";
/// Minimum page-file size parameter.
pub const PARAM_PAGE_SIZE: &str = "gcache.page_size";
/// Soft ceiling for total page bytes.
pub const PARAM_KEEP_PAGES_SIZE: &str = "gcache.keep_pages_size";
/// Soft ceiling for shadow-plaintext bytes (encrypted mode).
pub const PARAM_KEEP_PLAINTEXT_SIZE: &str = "gcache.keep_plaintext_size";
/// Scan the ring buffer on start.
pub const PARAM_RECOVER: &str = "gcache.recover";
/// Cache verbosity bitmask.
pub const PARAM_DEBUG: &str = "gcache.debug";

/// Transport-layer parameters recognized and passed through untouched.
pub const PASSTHROUGH_PARAMS: [&str; 9] = [
    "gcs.fc_factor",
    "gcs.fc_limit",
    "gcs.fc_master_slave",
    "gcs.fc_debug",
    "gcs.sync_donor",
    "gcs.max_packet_size",
    "gcs.recv_q_hard_limit",
    "gcs.recv_q_soft_limit",
    "gcs.max_throttle",
];

/// Configuration error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParamsError {
    key: String,
    detail: String,
}

impl ParamsError {
    fn new(key: &str, detail: impl Into<String>) -> Self {
        Self {
            key: key.to_owned(),
            detail: detail.into(),
        }
    }
}

impl fmt::Display for ParamsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid value for '{}': {}", self.key, self.detail)
    }
}

impl std::error::Error for ParamsError {}

/// Parse a size string with an optional `K`/`M`/`G` suffix.
pub fn parse_size(s: &str) -> Result<u64, String> {
    let s = s.trim();
    if s.is_empty() {
        return Err("empty size".to_owned());
    }
    let (digits, mult) = match s.as_bytes()[s.len() - 1].to_ascii_uppercase() {
        b'K' => (&s[..s.len() - 1], 1u64 << 10),
        b'M' => (&s[..s.len() - 1], 1u64 << 20),
        b'G' => (&s[..s.len() - 1], 1u64 << 30),
        _ => (s, 1),
    };
    let base: u64 = digits
        .trim()
        .parse()
        .map_err(|e| format!("'{s}': {e}"))?;
    base.checked_mul(mult)
        .ok_or_else(|| format!("'{s}': size overflow"))
}

/// Cache and replication parameters with their defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Params {
    /// Directory all cache files live in.
    pub dir: PathBuf,
    /// Ring-buffer file name (relative names resolve against `dir`).
    pub cache_name: String,
    /// Heap-store byte budget.
    pub mem_size: u64,
    /// Ring-buffer file size.
    pub cache_size: u64,
    /// Minimum page-file size.
    pub page_size: u64,
    /// Soft ceiling for total page bytes.
    pub keep_pages_size: u64,
    /// Soft ceiling for retained plaintext shadows (encrypted mode).
    pub keep_plaintext_size: u64,
    /// Scan the ring buffer on start (ignored when encryption is on).
    pub recover: bool,
    /// Verbosity bitmask for cache internals.
    pub debug: u32,
    /// Unrecognized `gcs.*` options, passed to the transport untouched.
    pub passthrough: HashMap<String, String>,
}

impl Default for Params {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("."),
            cache_name: "galera.cache".to_owned(),
            mem_size: 0,
            cache_size: 128 << 20,
            page_size: 128 << 20,
            keep_pages_size: 0,
            keep_plaintext_size: 128 << 20,
            recover: false,
            debug: 0,
            passthrough: HashMap::new(),
        }
    }
}

impl Params {
    /// Build from a flat key/value option map, applying defaults for
    /// anything unset.
    pub fn from_options(
        dir: impl Into<PathBuf>,
        options: &HashMap<String, String>,
    ) -> Result<Self, ParamsError> {
        let mut p = Self {
            dir: dir.into(),
            ..Self::default()
        };
        for (key, value) in options {
            match key.as_str() {
                PARAM_CACHE_NAME => p.cache_name.clone_from(value),
                PARAM_CACHE_SIZE => p.cache_size = size_of(key, value)?,
                PARAM_MEM_SIZE => p.mem_size = size_of(key, value)?,
                PARAM_PAGE_SIZE => p.page_size = size_of(key, value)?,
                PARAM_KEEP_PAGES_SIZE => p.keep_pages_size = size_of(key, value)?,
                PARAM_KEEP_PLAINTEXT_SIZE => {
                    p.keep_plaintext_size = size_of(key, value)?;
                }
                PARAM_RECOVER => {
                    p.recover = value
                        .parse()
                        .map_err(|_| ParamsError::new(key, "expected true/false"))?;
                }
                PARAM_DEBUG => {
                    p.debug = value
                        .parse()
                        .map_err(|_| ParamsError::new(key, "expected an integer"))?;
                }
                other if other.starts_with("gcs.") => {
                    p.passthrough.insert(key.clone(), value.clone());
                }
                other => {
                    return Err(ParamsError::new(other, "unknown parameter"));
                }
            }
        }
        Ok(p)
    }

    /// Full path of the ring-buffer file.
    #[must_use]
    pub fn cache_path(&self) -> PathBuf {
        self.dir.join(&self.cache_name)
    }
}

fn size_of(key: &str, value: &str) -> Result<u64, ParamsError> {
    parse_size(value).map_err(|e| ParamsError::new(key, e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_size_suffixes() {
        assert_eq!(parse_size("0").unwrap(), 0);
        assert_eq!(parse_size("1024").unwrap(), 1024);
        assert_eq!(parse_size("4K").unwrap(), 4096);
        assert_eq!(parse_size("1M").unwrap(), 1 << 20);
        assert_eq!(parse_size("2G").unwrap(), 2 << 30);
        assert_eq!(parse_size("128m").unwrap(), 128 << 20);
        assert!(parse_size("").is_err());
        assert!(parse_size("12Q").is_err());
    }

    #[test]
    fn options_round_trip() {
        let mut opts = HashMap::new();
        opts.insert(PARAM_CACHE_SIZE.to_owned(), "1M".to_owned());
        opts.insert(PARAM_RECOVER.to_owned(), "true".to_owned());
        opts.insert("gcs.fc_limit".to_owned(), "16".to_owned());
        let p = Params::from_options("/tmp", &opts).unwrap();
        assert_eq!(p.cache_size, 1 << 20);
        assert!(p.recover);
        assert_eq!(p.passthrough["gcs.fc_limit"], "16");
        assert_eq!(p.cache_path(), PathBuf::from("/tmp/galera.cache"));
    }

    #[test]
    fn unknown_parameter_rejected() {
        let mut opts = HashMap::new();
        opts.insert("gcache.bogus".to_owned(), "1".to_owned());
        assert!(Params::from_options(".", &opts).is_err());
    }
}
