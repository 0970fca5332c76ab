//! Record frame codec.
//!
//! A frame is `length:u32 | xxh64(payload):u64 | payload`, big-endian. The
//! length prefix makes every frame self-delimiting, so a decoder can always
//! tell an incomplete frame from a damaged one, and can skip a damaged frame
//! without losing its place in the stream.

/// Size of the frame header in bytes.
pub const HEADER_SIZE: usize = 4 + 8;

/// Result of decoding the front of a byte slice.
#[derive(Debug, PartialEq, Eq)]
pub enum Frame<'a> {
    /// A valid frame. `len` is the full encoded size.
    Complete { payload: &'a [u8], len: usize },
    /// Not enough bytes yet to hold the header or the declared payload.
    Incomplete,
    /// Checksum mismatch or an impossible length. `len` is the encoded size
    /// the header declares.
    Corrupt { len: usize },
}

/// Encoded size of a payload of `payload_len` bytes.
pub fn encoded_len(payload_len: usize) -> usize {
    HEADER_SIZE + payload_len
}

/// Checksum of a payload, as stored in the frame header.
pub fn checksum(payload: &[u8]) -> u64 {
    xxhash_rust::xxh64::xxh64(payload, 0)
}

/// Append the frame for `payload` to `buf`. Returns the encoded size.
pub fn encode(buf: &mut Vec<u8>, payload: &[u8]) -> usize {
    buf.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    buf.extend_from_slice(&checksum(payload).to_be_bytes());
    buf.extend_from_slice(payload);
    encoded_len(payload.len())
}

/// Decode the frame at the front of `buf`.
///
/// `max_payload` bounds the declared length; anything larger is treated as a
/// damaged header rather than a request to buffer gigabytes.
pub fn decode(buf: &[u8], max_payload: usize) -> Frame<'_> {
    if buf.len() < HEADER_SIZE {
        return Frame::Incomplete;
    }

    let mut len_bytes = [0u8; 4];
    len_bytes.copy_from_slice(&buf[0..4]);
    let payload_len = u32::from_be_bytes(len_bytes) as usize;
    let len = encoded_len(payload_len);

    if payload_len > max_payload {
        return Frame::Corrupt { len };
    }
    if buf.len() < len {
        return Frame::Incomplete;
    }

    let mut sum_bytes = [0u8; 8];
    sum_bytes.copy_from_slice(&buf[4..HEADER_SIZE]);
    let stored = u64::from_be_bytes(sum_bytes);

    let payload = &buf[HEADER_SIZE..len];
    if checksum(payload) != stored {
        return Frame::Corrupt { len };
    }

    Frame::Complete { payload, len }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_complete_frame() {
        let mut buf = Vec::new();
        let n = encode(&mut buf, b"hello");
        assert_eq!(n, HEADER_SIZE + 5);
        assert_eq!(
            decode(&buf, 1024),
            Frame::Complete {
                payload: b"hello",
                len: n
            }
        );
    }

    #[test]
    fn empty_payload_is_valid() {
        let mut buf = Vec::new();
        encode(&mut buf, b"");
        assert_eq!(
            decode(&buf, 1024),
            Frame::Complete {
                payload: b"",
                len: HEADER_SIZE
            }
        );
    }

    #[test]
    fn every_proper_prefix_is_incomplete() {
        let mut buf = Vec::new();
        encode(&mut buf, b"some payload");
        for cut in 0..buf.len() {
            assert_eq!(decode(&buf[..cut], 1024), Frame::Incomplete, "cut at {cut}");
        }
    }

    #[test]
    fn flipped_payload_byte_is_corrupt_with_length() {
        let mut buf = Vec::new();
        let n = encode(&mut buf, b"payload");
        buf[HEADER_SIZE + 2] ^= 0x01;
        assert_eq!(decode(&buf, 1024), Frame::Corrupt { len: n });
    }

    #[test]
    fn oversized_length_is_corrupt() {
        let mut buf = Vec::new();
        encode(&mut buf, &[7u8; 100]);
        assert!(matches!(decode(&buf, 50), Frame::Corrupt { .. }));
    }

    #[test]
    fn decodes_first_of_concatenated_frames() {
        let mut buf = Vec::new();
        let first = encode(&mut buf, b"a");
        encode(&mut buf, b"bb");
        match decode(&buf, 1024) {
            Frame::Complete { payload, len } => {
                assert_eq!(payload, b"a");
                assert_eq!(len, first);
                assert!(matches!(
                    decode(&buf[len..], 1024),
                    Frame::Complete { payload: b"bb", .. }
                ));
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}
