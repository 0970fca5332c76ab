//! Persistent, versioned log configuration.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{self, Write};
use std::path::Path;

const CONFIG_VERSION: u32 = 0;

/// Encoded size: version + max_record_size, seven 64-bit fields, trailing CRC.
pub(crate) const CONFIG_SIZE: usize = 2 * 4 + 7 * 8 + 4;

/// Per-log configuration, written once by [`Log::create`](crate::Log::create)
/// and immutable for the life of the directory.
///
/// Limits set to `None` are unbounded (stored as `-1` on disk).
///
/// # Examples
///
/// ```
/// use reclog::Config;
///
/// let config = Config {
///     segment_max_count: Some(1000),
///     log_max_age: Some(7 * 24 * 3600),
///     ..Config::default()
/// };
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Maximum payload size of a single record, in bytes.
    pub max_record_size: u32,
    /// Write a sparse index entry after every this many record bytes.
    pub index_after_size: u64,
    /// Seal the current segment once it holds this many records.
    pub segment_max_count: Option<u64>,
    /// Seal the current segment before it would exceed this many bytes.
    pub segment_max_size: Option<u64>,
    /// Seal the current segment once it is this many seconds old.
    pub segment_max_age: Option<u64>,
    /// Expire the oldest segments once the log holds more records than this.
    pub log_max_count: Option<u64>,
    /// Expire the oldest segments once the log holds more bytes than this.
    pub log_max_size: Option<u64>,
    /// Expire segments created more than this many seconds ago.
    pub log_max_age: Option<u64>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            max_record_size: 1 << 20,
            index_after_size: 1 << 20,
            segment_max_count: None,
            segment_max_size: Some(1 << 30),
            segment_max_age: None,
            log_max_count: None,
            log_max_size: None,
            log_max_age: None,
        }
    }
}

impl Config {
    /// Reject values the engine cannot operate with.
    pub fn validate(&self) -> Result<()> {
        if self.max_record_size == 0 {
            return Err(Error::InvalidConfig("max_record_size must be positive".into()));
        }
        if self.index_after_size == 0 {
            return Err(Error::InvalidConfig("index_after_size must be positive".into()));
        }
        let limits = [
            ("segment_max_count", self.segment_max_count),
            ("segment_max_size", self.segment_max_size),
            ("segment_max_age", self.segment_max_age),
            ("log_max_count", self.log_max_count),
            ("log_max_size", self.log_max_size),
            ("log_max_age", self.log_max_age),
        ];
        for (name, limit) in limits {
            match limit {
                Some(0) => {
                    return Err(Error::InvalidConfig(format!("{name} must be positive")));
                }
                Some(v) if v > i64::MAX as u64 => {
                    return Err(Error::InvalidConfig(format!("{name} is too large")));
                }
                _ => {}
            }
        }
        if self.index_after_size > i64::MAX as u64 {
            return Err(Error::InvalidConfig("index_after_size is too large".into()));
        }
        Ok(())
    }

    /// Encode to the fixed on-disk layout, checksum included.
    pub(crate) fn encode(&self) -> [u8; CONFIG_SIZE] {
        let mut buf = [0u8; CONFIG_SIZE];
        let mut n = 0;

        put(&mut buf, &mut n, &CONFIG_VERSION.to_be_bytes());
        put(&mut buf, &mut n, &self.max_record_size.to_be_bytes());
        put(&mut buf, &mut n, &self.index_after_size.to_be_bytes());
        for limit in self.limits() {
            put(&mut buf, &mut n, &encode_limit(limit).to_be_bytes());
        }

        let crc = crc32c::crc32c(&buf[..n]);
        put(&mut buf, &mut n, &crc.to_be_bytes());
        debug_assert_eq!(n, CONFIG_SIZE);
        buf
    }

    /// Decode the on-disk layout. The version tag is checked before the size
    /// so that a future, longer layout reports `UnknownVersion`.
    pub(crate) fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < 4 {
            return Err(Error::ConfigCorrupt);
        }
        let version = read_u32(buf, 0);
        if version != CONFIG_VERSION {
            return Err(Error::UnknownVersion(version));
        }
        if buf.len() != CONFIG_SIZE {
            return Err(Error::ConfigCorrupt);
        }

        let body = &buf[..CONFIG_SIZE - 4];
        let stored = read_u32(buf, CONFIG_SIZE - 4);
        if crc32c::crc32c(body) != stored {
            return Err(Error::ConfigCorrupt);
        }

        let mut n = 4;
        let max_record_size = read_u32(buf, n);
        n += 4;
        let index_after_size = read_u64(buf, n);
        n += 8;
        let mut limits = [None; 6];
        for limit in limits.iter_mut() {
            *limit = decode_limit(read_u64(buf, n) as i64);
            n += 8;
        }

        Ok(Config {
            max_record_size,
            index_after_size,
            segment_max_count: limits[0],
            segment_max_size: limits[1],
            segment_max_age: limits[2],
            log_max_count: limits[3],
            log_max_size: limits[4],
            log_max_age: limits[5],
        })
    }

    /// Write the config file and fsync it.
    pub(crate) fn dump(&self, path: &Path) -> io::Result<()> {
        let mut file = fs::File::create(path)?;
        file.write_all(&self.encode())?;
        file.sync_all()?;
        Ok(())
    }

    /// Load and verify the config file.
    pub(crate) fn load(path: &Path) -> Result<Self> {
        let buf = match fs::read(path) {
            Ok(buf) => buf,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Err(Error::NotExist),
            Err(e) => return Err(e.into()),
        };
        Config::decode(&buf)
    }

    fn limits(&self) -> [Option<u64>; 6] {
        [
            self.segment_max_count,
            self.segment_max_size,
            self.segment_max_age,
            self.log_max_count,
            self.log_max_size,
            self.log_max_age,
        ]
    }
}

fn encode_limit(limit: Option<u64>) -> i64 {
    match limit {
        Some(v) => v as i64,
        None => -1,
    }
}

fn decode_limit(raw: i64) -> Option<u64> {
    if raw < 0 { None } else { Some(raw as u64) }
}

fn put(buf: &mut [u8], n: &mut usize, bytes: &[u8]) {
    buf[*n..*n + bytes.len()].copy_from_slice(bytes);
    *n += bytes.len();
}

fn read_u32(buf: &[u8], at: usize) -> u32 {
    let mut b = [0u8; 4];
    b.copy_from_slice(&buf[at..at + 4]);
    u32::from_be_bytes(b)
}

fn read_u64(buf: &[u8], at: usize) -> u64 {
    let mut b = [0u8; 8];
    b.copy_from_slice(&buf[at..at + 8]);
    u64::from_be_bytes(b)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Config {
        Config {
            max_record_size: 4096,
            index_after_size: 512,
            segment_max_count: Some(10),
            segment_max_size: None,
            segment_max_age: Some(60),
            log_max_count: None,
            log_max_size: Some(1 << 20),
            log_max_age: None,
        }
    }

    #[test]
    fn decode_accepts_encoded() {
        let config = sample();
        assert_eq!(Config::decode(&config.encode()).unwrap(), config);
    }

    #[test]
    fn unbounded_limits_stored_as_minus_one() {
        let buf = Config::default().encode();
        // segment_max_count is the first limit, right after the two fixed fields.
        assert_eq!(&buf[16..24], &(-1i64).to_be_bytes());
    }

    #[test]
    fn flipped_byte_is_corrupt() {
        let mut buf = sample().encode();
        buf[10] ^= 0xff;
        assert!(matches!(Config::decode(&buf), Err(Error::ConfigCorrupt)));
    }

    #[test]
    fn truncated_is_corrupt() {
        let buf = sample().encode();
        assert!(matches!(
            Config::decode(&buf[..CONFIG_SIZE - 1]),
            Err(Error::ConfigCorrupt)
        ));
        assert!(matches!(Config::decode(&buf[..2]), Err(Error::ConfigCorrupt)));
    }

    #[test]
    fn unknown_version_checked_first() {
        let mut buf = sample().encode().to_vec();
        buf[3] = 7;
        buf.push(0);
        assert!(matches!(Config::decode(&buf), Err(Error::UnknownVersion(7))));
    }

    #[test]
    fn validate_rejects_zero_limits() {
        let config = Config {
            log_max_count: Some(0),
            ..Config::default()
        };
        assert!(matches!(config.validate(), Err(Error::InvalidConfig(_))));

        let config = Config {
            max_record_size: 0,
            ..Config::default()
        };
        assert!(config.validate().is_err());
    }
}
