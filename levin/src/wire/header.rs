use bitflags::bitflags;

use crate::error::{LevinError, LevinResult};

/// First 8 bytes of every frame. Constant across the whole protocol so a
/// stream can always be resynchronized by scanning for it.
pub const SIGNATURE: u64 = 0x0101010101012101;

pub const HEADER_SIZE: usize = 33;

pub const PROTOCOL_VERSION_1: u32 = 1;

/// Packet size ceiling in effect before the handshake command completes.
pub const INITIAL_MAX_PACKET_SIZE: u64 = 256 * 1024;

/// Packet size ceiling in effect once the handshake has completed.
pub const DEFAULT_MAX_PACKET_SIZE: u64 = 100_000_000;

bitflags! {
    /// Frame role bits, carried in the header's `flags` field. `BEGIN`/`END`
    /// mark the first/last frame of a fragmented notify; a single-frame
    /// message carries both.
    #[derive(Copy, Clone, Debug, Eq, PartialEq)]
    pub struct Flags: u32 {
        const REQUEST  = 0b0001;
        const RESPONSE = 0b0010;
        const BEGIN    = 0b0100;
        const END      = 0b1000;
    }
}

impl std::fmt::Display for Flags {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_empty() {
            return write!(f, "none");
        }
        let names = [
            (Flags::REQUEST, "REQUEST"),
            (Flags::RESPONSE, "RESPONSE"),
            (Flags::BEGIN, "BEGIN"),
            (Flags::END, "END"),
        ];
        let set: Vec<&str> = names.into_iter().filter(|(bit, _)| self.contains(*bit)).map(|(_, name)| name).collect();
        write!(f, "{}", set.join("|"))
    }
}

/// The 33-byte frame header (`bucket_head2` in the reference implementation).
///
/// Wire layout, all fields little-endian:
/// `signature(8) | body_length(8) | expect_response(1) | command(4) | return_code(4) | flags(4) | protocol_version(4)`
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Header {
    pub body_length: u64,
    pub expect_response: bool,
    pub command: u32,
    pub return_code: i32,
    pub flags: Flags,
    pub protocol_version: u32,
}

impl Header {
    pub fn new(command: u32, body_length: u64, flags: Flags, expect_response: bool) -> Self {
        Header {
            body_length,
            expect_response,
            command,
            return_code: 0,
            flags,
            protocol_version: PROTOCOL_VERSION_1,
        }
    }

    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        buf[0..8].copy_from_slice(&SIGNATURE.to_le_bytes());
        buf[8..16].copy_from_slice(&self.body_length.to_le_bytes());
        buf[16] = self.expect_response as u8;
        buf[17..21].copy_from_slice(&self.command.to_le_bytes());
        buf[21..25].copy_from_slice(&self.return_code.to_le_bytes());
        buf[25..29].copy_from_slice(&self.flags.bits().to_le_bytes());
        buf[29..33].copy_from_slice(&self.protocol_version.to_le_bytes());
        buf
    }

    /// Decodes a header from an already signature-checked 33-byte slice.
    pub fn decode(buf: &[u8]) -> LevinResult<Self> {
        if buf.len() < HEADER_SIZE {
            return Err(LevinError::Format(format!(
                "header needs {HEADER_SIZE} bytes, got {}",
                buf.len()
            )));
        }
        let signature = u64::from_le_bytes(buf[0..8].try_into().unwrap());
        if signature != SIGNATURE {
            return Err(LevinError::Format(format!(
                "bad signature {signature:#x}, expected {SIGNATURE:#x}"
            )));
        }
        let body_length = u64::from_le_bytes(buf[8..16].try_into().unwrap());
        let expect_response = buf[16] != 0;
        let command = u32::from_le_bytes(buf[17..21].try_into().unwrap());
        let return_code = i32::from_le_bytes(buf[21..25].try_into().unwrap());
        let flags_bits = u32::from_le_bytes(buf[25..29].try_into().unwrap());
        let flags = Flags::from_bits_truncate(flags_bits);
        let protocol_version = u32::from_le_bytes(buf[29..33].try_into().unwrap());

        Ok(Header {
            body_length,
            expect_response,
            command,
            return_code,
            flags,
            protocol_version,
        })
    }

    /// `true` once the first 8 bytes of a partial buffer are known not to be
    /// the signature, which lets the parser reject garbage before a full
    /// header has even arrived.
    pub fn signature_prefix_matches(prefix: &[u8]) -> bool {
        let n = prefix.len().min(8);
        let sig_bytes = SIGNATURE.to_le_bytes();
        prefix[..n] == sig_bytes[..n]
    }
}
