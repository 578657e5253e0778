//! On-disk entry framing.
//!
//! ```text
//! [4B total-len][1B type-len][type-bytes][4B payload-len][payload-bytes][4B crc32]
//! ```
//!
//! `total-len` covers everything after itself. The CRC is computed over the
//! type bytes followed by the payload bytes.

use tether_core::{Result, TetherError};

/// Fixed framing bytes per entry, excluding the type string itself.
pub const FRAME_OVERHEAD: usize = 4 + 1 + 4 + 4;

/// Maximum entry type length representable in the 1-byte length field.
pub const MAX_TYPE_LEN: usize = u8::MAX as usize;

/// Total on-disk size of an entry with the given type and payload lengths.
pub fn frame_size(type_len: usize, payload_len: usize) -> usize {
    FRAME_OVERHEAD + type_len + payload_len
}

pub fn encode(entry_type: &str, data: &[u8]) -> Result<Vec<u8>> {
    let type_bytes = entry_type.as_bytes();
    if type_bytes.is_empty() || type_bytes.len() > MAX_TYPE_LEN {
        return Err(TetherError::InvalidRequest(format!(
            "wal entry type must be 1..={MAX_TYPE_LEN} bytes, got {}",
            type_bytes.len()
        )));
    }
    let total_len = 1 + type_bytes.len() + 4 + data.len() + 4;
    let mut buf = Vec::with_capacity(4 + total_len);
    buf.extend_from_slice(&(total_len as u32).to_be_bytes());
    buf.push(type_bytes.len() as u8);
    buf.extend_from_slice(type_bytes);
    buf.extend_from_slice(&(data.len() as u32).to_be_bytes());
    buf.extend_from_slice(data);

    let mut hasher = crc32fast::Hasher::new();
    hasher.update(type_bytes);
    hasher.update(data);
    buf.extend_from_slice(&hasher.finalize().to_be_bytes());
    Ok(buf)
}

/// A frame decoded from a segment buffer.
pub struct DecodedFrame<'a> {
    pub entry_type: &'a str,
    pub data: &'a [u8],
    /// Total bytes consumed from the buffer.
    pub consumed: usize,
}

/// Outcome of attempting to decode the frame at the start of `buf`.
pub enum FrameRead<'a> {
    Frame(DecodedFrame<'a>),
    /// Buffer is empty: clean end of segment.
    End,
    /// Torn or corrupt frame: everything from here on is discarded.
    Torn,
}

pub fn decode(buf: &[u8]) -> FrameRead<'_> {
    if buf.is_empty() {
        return FrameRead::End;
    }
    if buf.len() < 4 {
        return FrameRead::Torn;
    }
    let total_len = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
    if buf.len() < 4 + total_len || total_len < 1 + 4 + 4 {
        return FrameRead::Torn;
    }
    let body = &buf[4..4 + total_len];
    let type_len = body[0] as usize;
    if type_len == 0 || 1 + type_len + 4 + 4 > total_len {
        return FrameRead::Torn;
    }
    let type_bytes = &body[1..1 + type_len];
    let payload_len = u32::from_be_bytes([
        body[1 + type_len],
        body[1 + type_len + 1],
        body[1 + type_len + 2],
        body[1 + type_len + 3],
    ]) as usize;
    if 1 + type_len + 4 + payload_len + 4 != total_len {
        return FrameRead::Torn;
    }
    let payload = &body[1 + type_len + 4..1 + type_len + 4 + payload_len];
    let stored_crc = u32::from_be_bytes([
        body[total_len - 4],
        body[total_len - 3],
        body[total_len - 2],
        body[total_len - 1],
    ]);
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(type_bytes);
    hasher.update(payload);
    if hasher.finalize() != stored_crc {
        return FrameRead::Torn;
    }
    let entry_type = match std::str::from_utf8(type_bytes) {
        Ok(s) => s,
        Err(_) => return FrameRead::Torn,
    };
    FrameRead::Frame(DecodedFrame {
        entry_type,
        data: payload,
        consumed: 4 + total_len,
    })
}
