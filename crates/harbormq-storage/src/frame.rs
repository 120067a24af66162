//! Length-prefixed, checksummed framing shared by journal and page files.
//!
//! Frame layout: `[u32 len (LE)][u32 crc32 (LE)][payload; len]`.

/// Size of the frame header in bytes.
pub const FRAME_HEADER_LEN: usize = 8;

/// Encodes `payload` as a single frame.
pub fn encode_frame(payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(FRAME_HEADER_LEN + payload.len());
    out.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    out.extend_from_slice(&crc32fast::hash(payload).to_le_bytes());
    out.extend_from_slice(payload);
    out
}

/// Result of decoding a byte buffer into frames.
#[derive(Debug)]
pub struct DecodedFrames<'a> {
    /// Payloads of every intact frame, in file order.
    pub frames: Vec<&'a [u8]>,
    /// Number of bytes covered by intact frames.
    pub valid_len: usize,
}

impl DecodedFrames<'_> {
    /// True when bytes after the last intact frame were discarded.
    pub fn is_torn(&self, total_len: usize) -> bool {
        self.valid_len < total_len
    }
}

/// Decodes consecutive frames, stopping at the first short or corrupt frame.
pub fn decode_frames(data: &[u8]) -> DecodedFrames<'_> {
    let mut frames = Vec::new();
    let mut offset = 0usize;

    while data.len() - offset >= FRAME_HEADER_LEN {
        let len = u32::from_le_bytes([
            data[offset],
            data[offset + 1],
            data[offset + 2],
            data[offset + 3],
        ]) as usize;
        let crc = u32::from_le_bytes([
            data[offset + 4],
            data[offset + 5],
            data[offset + 6],
            data[offset + 7],
        ]);
        let start = offset + FRAME_HEADER_LEN;
        if data.len() - start < len {
            break;
        }
        let payload = &data[start..start + len];
        if crc32fast::hash(payload) != crc {
            break;
        }
        frames.push(payload);
        offset = start + len;
    }

    DecodedFrames {
        frames,
        valid_len: offset,
    }
}
