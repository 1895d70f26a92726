//! Frame codec.
//!
//! Encodes messages into `[magic][u32-le length][payload]` frames and
//! reassembles frames from arbitrarily split reads.

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::ProtocolError;

/// First byte of every frame (`'W'`).
pub const MAGIC: u8 = 0x57;

/// Magic byte plus the 4-byte length field.
pub const HEADER_LEN: usize = 1 + 4;

/// Largest payload a decoder will accept (64 MiB).
pub const MAX_FRAME_LEN: usize = 64 * 1024 * 1024;

/// Prefix `payload` with a frame header.
///
/// Header and payload are returned in a single buffer so the caller can
/// issue one write.
pub fn encode_frame(payload: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(HEADER_LEN + payload.len());
    frame.push(MAGIC);
    frame.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    frame.extend_from_slice(payload);
    frame
}

/// Serialize `message` and wrap it in a frame.
pub fn encode_message<T: Serialize>(message: &T) -> Result<Vec<u8>, ProtocolError> {
    let payload = serde_json::to_vec(message)?;
    if payload.len() > MAX_FRAME_LEN {
        return Err(ProtocolError::FrameTooLarge {
            length: payload.len(),
            max: MAX_FRAME_LEN,
        });
    }
    Ok(encode_frame(&payload))
}

/// Parse a frame payload produced by [`encode_message`].
pub fn decode_message<T: DeserializeOwned>(payload: &[u8]) -> Result<T, ProtocolError> {
    Ok(serde_json::from_slice(payload)?)
}

/// Incremental frame reassembler.
///
/// Feed it whatever the transport returned with [`FrameDecoder::extend`] and
/// pull complete payloads with [`FrameDecoder::next_frame`]. Partial frames
/// stay buffered until the rest arrives.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buffer: Vec<u8>,
}

impl FrameDecoder {
    /// Create an empty decoder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append bytes read from the transport.
    pub fn extend(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Number of bytes buffered and not yet returned as a frame.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Extract the next complete payload.
    ///
    /// Returns `Ok(None)` when more data is needed. A wrong magic byte is a
    /// desync and is returned as an error; the buffer is left untouched so the
    /// offending bytes can be inspected, but the decoder must not be reused.
    pub fn next_frame(&mut self) -> Result<Option<Vec<u8>>, ProtocolError> {
        if self.buffer.len() < HEADER_LEN {
            return Ok(None);
        }

        let magic = self.buffer[0];
        if magic != MAGIC {
            return Err(ProtocolError::BadMagic {
                expected: MAGIC,
                found: magic,
            });
        }

        let length = u32::from_le_bytes([
            self.buffer[1],
            self.buffer[2],
            self.buffer[3],
            self.buffer[4],
        ]) as usize;
        if length > MAX_FRAME_LEN {
            return Err(ProtocolError::FrameTooLarge {
                length,
                max: MAX_FRAME_LEN,
            });
        }

        let end = HEADER_LEN + length;
        if self.buffer.len() < end {
            return Ok(None);
        }

        let payload = self.buffer[HEADER_LEN..end].to_vec();
        self.buffer.drain(..end);
        Ok(Some(payload))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::{InformTeardown, Record, ServerRequest};
    use serde_json::json;

    #[test]
    fn test_header_layout() {
        let frame = encode_frame(b"abc");
        assert_eq!(frame, vec![0x57, 3, 0, 0, 0, b'a', b'b', b'c']);
    }

    #[test]
    fn test_needs_full_header() {
        let mut decoder = FrameDecoder::new();
        decoder.extend(&[MAGIC, 1, 0]);
        assert!(decoder.next_frame().unwrap().is_none());
        assert_eq!(decoder.buffered(), 3);
    }

    #[test]
    fn test_byte_at_a_time_delivery() {
        let request = ServerRequest::RecordPublish(Record::new("s-1", json!({"history": {"loss": 0.5}})));
        let frame = encode_message(&request).unwrap();

        let mut decoder = FrameDecoder::new();
        let mut decoded = None;
        for (i, byte) in frame.iter().enumerate() {
            decoder.extend(std::slice::from_ref(byte));
            if let Some(payload) = decoder.next_frame().unwrap() {
                assert_eq!(i, frame.len() - 1, "frame must not complete early");
                decoded = Some(decode_message::<ServerRequest>(&payload).unwrap());
            }
        }

        assert_eq!(decoded, Some(request));
        assert_eq!(decoder.buffered(), 0);
    }

    #[test]
    fn test_two_frames_in_one_read() {
        let first = encode_message(&ServerRequest::InformTeardown(InformTeardown { exit_code: 3 })).unwrap();
        let second = encode_frame(b"{}");

        let mut bytes = first.clone();
        bytes.extend_from_slice(&second);

        let mut decoder = FrameDecoder::new();
        decoder.extend(&bytes);

        let payload = decoder.next_frame().unwrap().unwrap();
        assert_eq!(payload.len(), first.len() - HEADER_LEN);
        assert_eq!(decoder.next_frame().unwrap().unwrap(), b"{}".to_vec());
        assert!(decoder.next_frame().unwrap().is_none());
    }

    #[test]
    fn test_split_across_header_boundary() {
        let frame = encode_frame(b"payload");
        let (head, tail) = frame.split_at(3);

        let mut decoder = FrameDecoder::new();
        decoder.extend(head);
        assert!(decoder.next_frame().unwrap().is_none());
        decoder.extend(tail);
        assert_eq!(decoder.next_frame().unwrap().unwrap(), b"payload".to_vec());
    }

    #[test]
    fn test_bad_magic_is_desync() {
        let mut decoder = FrameDecoder::new();
        decoder.extend(&[b'X', 0, 0, 0, 0]);

        let err = decoder.next_frame().unwrap_err();
        assert!(err.is_desync());
        assert!(matches!(err, ProtocolError::BadMagic { found: b'X', .. }));
    }

    #[test]
    fn test_oversized_length_rejected() {
        let mut decoder = FrameDecoder::new();
        let mut header = vec![MAGIC];
        header.extend_from_slice(&u32::MAX.to_le_bytes());
        decoder.extend(&header);

        assert!(matches!(
            decoder.next_frame(),
            Err(ProtocolError::FrameTooLarge { .. })
        ));
    }

    #[test]
    fn test_empty_payload() {
        let mut decoder = FrameDecoder::new();
        decoder.extend(&encode_frame(&[]));
        assert_eq!(decoder.next_frame().unwrap(), Some(Vec::new()));
    }
}
