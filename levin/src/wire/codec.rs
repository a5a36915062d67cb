//! Frame encoders. Ported from the reference `make_notify`/`make_noise_notify`/
//! `make_fragmented_notify` trio: given a command and a payload, produce the
//! bytes to put on the wire.

use crate::wire::header::{Flags, Header, HEADER_SIZE};

/// A single REQUEST frame carrying `payload` under `command`, with no
/// response expected. This is the ordinary "notify" shape.
pub fn encode_notify(command: u32, payload: &[u8]) -> Vec<u8> {
    let header = Header::new(command, payload.len() as u64, Flags::REQUEST, false);
    let mut result = Vec::with_capacity(HEADER_SIZE + payload.len());
    result.extend_from_slice(&header.encode());
    result.extend_from_slice(payload);
    result
}

/// A single REQUEST frame carrying a payload that expects a response.
pub fn encode_invoke(command: u32, payload: &[u8]) -> Vec<u8> {
    let header = Header::new(command, payload.len() as u64, Flags::REQUEST, true);
    let mut result = Vec::with_capacity(HEADER_SIZE + payload.len());
    result.extend_from_slice(&header.encode());
    result.extend_from_slice(payload);
    result
}

/// A RESPONSE frame: same shape as [`encode_notify`] but flagged RESPONSE
/// and carrying a wire return code instead of expecting one back.
pub fn encode_response(command: u32, return_code: i32, payload: &[u8]) -> Vec<u8> {
    let mut header = Header::new(command, payload.len() as u64, Flags::RESPONSE, false);
    header.return_code = return_code;
    let mut result = Vec::with_capacity(HEADER_SIZE + payload.len());
    result.extend_from_slice(&header.encode());
    result.extend_from_slice(payload);
    result
}

/// A content-free frame of exactly `noise_bytes` bytes, used to defeat
/// traffic analysis on connections that have nothing real to say. Empty if
/// `noise_bytes` can't even fit a header.
pub fn encode_noise_notify(noise_bytes: usize) -> Vec<u8> {
    if noise_bytes < HEADER_SIZE {
        return Vec::new();
    }
    let mut buffer = vec![0u8; noise_bytes];
    let header = Header::new(0, (noise_bytes - HEADER_SIZE) as u64, Flags::BEGIN | Flags::END, false);
    buffer[..HEADER_SIZE].copy_from_slice(&header.encode());
    buffer
}

/// Encodes `payload` under `command`, padding or fragmenting it into one or
/// more frames of exactly `noise_message.len()` bytes each, so an observer
/// watching frame sizes on the wire learns nothing about the true payload
/// length. `noise_message` doubles as both the fragment size and the source
/// of the padding bytes trailing the last frame.
///
/// Returns an empty `Vec` if `noise_message` can't fit two headers (the
/// minimum needed to express a BEGIN/END pair).
pub fn encode_fragmented_notify(noise_message: &[u8], command: u32, payload: &[u8]) -> Vec<u8> {
    let noise_size = noise_message.len();
    if noise_size < HEADER_SIZE * 2 {
        return Vec::new();
    }

    let payload_space = noise_size - HEADER_SIZE;

    if payload.len() <= payload_space {
        // Fits in one frame; levin's binary parser ignores trailing bytes
        // past body_length, so pad with noise and send unfragmented.
        let header = Header::new(command, payload_space as u64, Flags::REQUEST, false);
        let mut result = Vec::with_capacity(noise_size);
        result.extend_from_slice(&header.encode());
        result.extend_from_slice(payload);
        result.extend_from_slice(&noise_message[HEADER_SIZE + payload.len()..]);
        return result;
    }

    let expected_fragments = (payload.len().saturating_sub(2)) / payload_space + 1;
    let mut result = Vec::with_capacity((expected_fragments + 1) * noise_size);

    // Outer BEGIN frame header: opaque command 0, flags BEGIN.
    let begin_header = Header::new(0, payload_space as u64, Flags::BEGIN, false);
    result.extend_from_slice(&begin_header.encode());

    // Inner header, embedded as the first bytes of the BEGIN frame's body:
    // carries the real command/flags/total-length that the reassembled
    // message will have.
    let inner_header = Header::new(command, payload.len() as u64, Flags::REQUEST, false);
    result.extend_from_slice(&inner_header.encode());

    let mut cursor = 0usize;
    let first_chunk = (payload_space - HEADER_SIZE).min(payload.len());
    result.extend_from_slice(&payload[cursor..cursor + first_chunk]);
    cursor += first_chunk;

    let mut last_chunk_len = first_chunk;
    while cursor < payload.len() {
        let chunk_len = payload_space.min(payload.len() - cursor);
        let is_last = cursor + chunk_len >= payload.len();
        let flags = if is_last { Flags::END } else { Flags::empty() };
        let frame_header = Header::new(0, payload_space as u64, flags, false);
        result.extend_from_slice(&frame_header.encode());
        result.extend_from_slice(&payload[cursor..cursor + chunk_len]);
        cursor += chunk_len;
        last_chunk_len = chunk_len;
    }

    // Pad the final frame out to noise_size using bytes from the noise
    // template at the same relative offset, matching the reference's
    // `noise_message.substr(copy_size + header_size)` tail append.
    let padding_start = HEADER_SIZE + last_chunk_len;
    if padding_start < noise_size {
        result.extend_from_slice(&noise_message[padding_start..]);
    }

    result
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::wire::header::Header;

    #[test]
    fn notify_is_request_flagged_single_frame() {
        let bytes = encode_notify(7, b"hello");
        let header = Header::decode(&bytes).unwrap();
        assert_eq!(header.command, 7);
        assert_eq!(header.body_length, 5);
        assert_eq!(header.flags, Flags::REQUEST);
        assert!(!header.expect_response);
        assert_eq!(&bytes[HEADER_SIZE..], b"hello");
    }

    #[test]
    fn invoke_sets_expect_response() {
        let bytes = encode_invoke(1, b"x");
        let header = Header::decode(&bytes).unwrap();
        assert!(header.expect_response);
    }

    #[test]
    fn noise_notify_below_header_size_is_empty() {
        assert!(encode_noise_notify(HEADER_SIZE - 1).is_empty());
    }

    #[test]
    fn noise_notify_produces_exact_size_begin_end_frame() {
        let bytes = encode_noise_notify(128);
        assert_eq!(bytes.len(), 128);
        let header = Header::decode(&bytes).unwrap();
        assert_eq!(header.flags, Flags::BEGIN | Flags::END);
        assert_eq!(header.body_length, 128 - HEADER_SIZE as u64);
    }

    #[test]
    fn fragmented_notify_below_two_headers_is_empty() {
        let noise = vec![0u8; HEADER_SIZE * 2 - 1];
        assert!(encode_fragmented_notify(&noise, 1, b"x").is_empty());
    }

    #[test]
    fn fragmented_notify_fits_single_frame_when_small() {
        let noise = vec![0u8; 256];
        let payload = b"small payload";
        let bytes = encode_fragmented_notify(&noise, 42, payload);
        assert_eq!(bytes.len(), 256);
        let header = Header::decode(&bytes).unwrap();
        assert_eq!(header.command, 42);
        assert_eq!(header.flags, Flags::REQUEST);
        assert_eq!(&bytes[HEADER_SIZE..HEADER_SIZE + payload.len()], payload);
    }

    #[test]
    fn fragmented_notify_splits_across_multiple_noise_sized_frames() {
        const NOISE_SIZE: usize = 128;
        let noise = vec![0u8; NOISE_SIZE];
        let payload = vec![0xABu8; 500];
        let bytes = encode_fragmented_notify(&noise, 99, &payload);
        assert_eq!(bytes.len() % NOISE_SIZE, 0);
        assert!(bytes.len() / NOISE_SIZE >= 2);

        let begin = Header::decode(&bytes[..HEADER_SIZE]).unwrap();
        assert_eq!(begin.flags, Flags::BEGIN);
        assert_eq!(begin.command, 0);

        let inner = Header::decode(&bytes[HEADER_SIZE..HEADER_SIZE * 2]).unwrap();
        assert_eq!(inner.command, 99);
        assert_eq!(inner.flags, Flags::REQUEST);
        assert_eq!(inner.body_length, 500);

        let last_frame_start = bytes.len() - NOISE_SIZE;
        let last = Header::decode(&bytes[last_frame_start..]).unwrap();
        assert_eq!(last.flags, Flags::END);
    }
}
