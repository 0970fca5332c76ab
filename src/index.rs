//! Sparse segment index.
//!
//! The index file is a flat run of fixed-size `(position, offset, timestamp)`
//! entries. An entry says "the record at `position` starts at log offset
//! `offset`". Entries only narrow the linear scan a seek has to do; a missing
//! or truncated index never affects correctness.

use std::fs::File;
use std::io::{self, Read};

/// Encoded size of one entry.
pub const ENTRY_SIZE: usize = 8 + 8 + 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexEntry {
    pub position: u64,
    pub offset: u64,
    pub timestamp: i64,
}

impl IndexEntry {
    pub fn encode(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.position.to_be_bytes());
        buf.extend_from_slice(&self.offset.to_be_bytes());
        buf.extend_from_slice(&self.timestamp.to_be_bytes());
    }

    pub fn decode(buf: &[u8]) -> Option<Self> {
        if buf.len() < ENTRY_SIZE {
            return None;
        }
        let field = |at: usize| {
            let mut b = [0u8; 8];
            b.copy_from_slice(&buf[at..at + 8]);
            b
        };
        Some(IndexEntry {
            position: u64::from_be_bytes(field(0)),
            offset: u64::from_be_bytes(field(8)),
            timestamp: i64::from_be_bytes(field(16)),
        })
    }
}

/// Read every whole entry from an index file. A torn trailing entry is
/// ignored.
pub fn read_entries(file: &mut File) -> io::Result<Vec<IndexEntry>> {
    let mut buf = Vec::new();
    file.read_to_end(&mut buf)?;
    Ok(buf
        .chunks_exact(ENTRY_SIZE)
        .filter_map(IndexEntry::decode)
        .collect())
}

/// The last entry at or before `position`, if any.
pub fn floor(entries: &[IndexEntry], position: u64) -> Option<IndexEntry> {
    let idx = entries.partition_point(|e| e.position <= position);
    idx.checked_sub(1).map(|i| entries[i])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(position: u64, offset: u64) -> IndexEntry {
        IndexEntry {
            position,
            offset,
            timestamp: 1_700_000_000,
        }
    }

    #[test]
    fn decode_reads_back_fields() {
        let mut buf = Vec::new();
        let e = IndexEntry {
            position: 42,
            offset: 4242,
            timestamp: -5,
        };
        e.encode(&mut buf);
        assert_eq!(buf.len(), ENTRY_SIZE);
        assert_eq!(IndexEntry::decode(&buf), Some(e));
        assert_eq!(IndexEntry::decode(&buf[..ENTRY_SIZE - 1]), None);
    }

    #[test]
    fn floor_picks_last_entry_not_after_position() {
        let entries = vec![entry(10, 100), entry(20, 200), entry(30, 300)];
        assert_eq!(floor(&entries, 5), None);
        assert_eq!(floor(&entries, 10), Some(entry(10, 100)));
        assert_eq!(floor(&entries, 29), Some(entry(20, 200)));
        assert_eq!(floor(&entries, 1000), Some(entry(30, 300)));
        assert_eq!(floor(&[], 3), None);
    }
}
