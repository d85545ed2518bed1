//! Length-prefixed framing for the analysis-worker stdin/stdout protocol.
//!
//! Layout per message: `byte0 = kind` (0 = UTF-8 JSON, 1 = raw binary),
//! `bytes1..4 = id` (u32 LE), `bytes5..8 = payload length` (u32 LE), then the
//! payload. One logical message may arrive split across arbitrarily many
//! chunks; a chunk that pushes a message past its declared length is a fatal
//! framing error for that stream.

use thiserror::Error;

/// `kind` byte of a JSON message.
pub const KIND_JSON: u8 = 0;
/// `kind` byte of a raw binary message.
pub const KIND_BINARY: u8 = 1;

/// Header bytes preceding every payload.
pub const HEADER_LEN: usize = 9;

/// Correlation id reserved for the worker's thumbnail notification.
pub const THUMBNAIL_ID: u32 = 0;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FramingError {
    #[error("unknown frame kind byte {0}")]
    UnknownKind(u8),
    #[error("received {got} payload bytes but frame declared {declared}")]
    Overrun { declared: usize, got: usize },
}

/// One decoded message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub kind: u8,
    pub id: u32,
    pub payload: Vec<u8>,
}

/// Encode a frame into a single contiguous buffer (writers must emit it in
/// one write so message boundaries survive the pipe).
pub fn encode_frame(kind: u8, id: u32, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(HEADER_LEN + payload.len());
    out.push(kind);
    out.extend_from_slice(&id.to_le_bytes());
    out.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    out.extend_from_slice(payload);
    out
}

/// Chunk-fed accumulator state machine: header-parsed → accumulating →
/// dispatch. Independent of the process-pipe abstraction feeding it.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    header: Vec<u8>,
    body: Vec<u8>,
    declared: Option<(u8, u32, usize)>,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// How many more bytes the current message needs before it dispatches.
    /// Readers that cap their reads at this hint never merge two messages
    /// into one chunk.
    pub fn needed(&self) -> usize {
        match self.declared {
            None => HEADER_LEN - self.header.len(),
            Some((_, _, len)) => HEADER_LEN + len - self.header.len() - self.body.len(),
        }
    }

    /// Feed one raw chunk; returns the completed frame, if any.
    pub fn push(&mut self, chunk: &[u8]) -> Result<Option<Frame>, FramingError> {
        let mut rest = chunk;

        if self.declared.is_none() {
            let take = (HEADER_LEN - self.header.len()).min(rest.len());
            self.header.extend_from_slice(&rest[..take]);
            rest = &rest[take..];
            if self.header.len() < HEADER_LEN {
                return Ok(None);
            }
            let kind = self.header[0];
            if kind != KIND_JSON && kind != KIND_BINARY {
                return Err(FramingError::UnknownKind(kind));
            }
            let id = u32::from_le_bytes(self.header[1..5].try_into().unwrap());
            let len = u32::from_le_bytes(self.header[5..9].try_into().unwrap()) as usize;
            self.declared = Some((kind, id, len));
        }

        let (kind, id, len) = self.declared.unwrap();
        if self.body.len() + rest.len() > len {
            return Err(FramingError::Overrun {
                declared: len,
                got: self.body.len() + rest.len(),
            });
        }
        self.body.extend_from_slice(rest);

        if self.body.len() == len {
            let frame = Frame {
                kind,
                id,
                payload: std::mem::take(&mut self.body),
            };
            self.header.clear();
            self.declared = None;
            Ok(Some(frame))
        } else {
            Ok(None)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_then_decode_round_trips() {
        let payload = b"{\"duration\":187.4}".to_vec();
        let bytes = encode_frame(KIND_JSON, 1, &payload);
        let mut dec = FrameDecoder::new();
        let frame = dec.push(&bytes).unwrap().expect("one whole chunk completes");
        assert_eq!(frame.kind, KIND_JSON);
        assert_eq!(frame.id, 1);
        assert_eq!(frame.payload, payload);
    }

    #[test]
    fn decode_survives_one_byte_chunks() {
        let payload: Vec<u8> = (0..=255).collect();
        let bytes = encode_frame(KIND_BINARY, 0xDEAD_BEEF, &payload);
        let mut dec = FrameDecoder::new();
        let mut got = None;
        for (i, b) in bytes.iter().enumerate() {
            match dec.push(std::slice::from_ref(b)).unwrap() {
                Some(frame) => {
                    assert_eq!(i, bytes.len() - 1, "must complete on the final byte");
                    got = Some(frame);
                }
                None => assert!(i < bytes.len() - 1),
            }
        }
        let frame = got.expect("frame completes");
        assert_eq!(frame.id, 0xDEAD_BEEF);
        assert_eq!(frame.payload, payload);
    }

    #[test]
    fn empty_payload_dispatches_on_header() {
        let bytes = encode_frame(KIND_BINARY, 7, &[]);
        let mut dec = FrameDecoder::new();
        let frame = dec.push(&bytes).unwrap().unwrap();
        assert!(frame.payload.is_empty());
        assert_eq!(frame.id, 7);
    }

    #[test]
    fn overrun_is_fatal() {
        let mut bytes = encode_frame(KIND_BINARY, 3, &[1, 2, 3]);
        bytes.push(0xFF); // one byte past the declared length
        let mut dec = FrameDecoder::new();
        assert_eq!(
            dec.push(&bytes),
            Err(FramingError::Overrun {
                declared: 3,
                got: 4
            })
        );
    }

    #[test]
    fn unknown_kind_is_fatal() {
        let mut bytes = encode_frame(KIND_JSON, 9, b"x");
        bytes[0] = 2;
        let mut dec = FrameDecoder::new();
        assert!(matches!(dec.push(&bytes), Err(FramingError::UnknownKind(2))));
    }

    #[test]
    fn needed_tracks_remaining_bytes() {
        let bytes = encode_frame(KIND_BINARY, 5, &[0; 16]);
        let mut dec = FrameDecoder::new();
        assert_eq!(dec.needed(), HEADER_LEN);
        assert!(dec.push(&bytes[..4]).unwrap().is_none());
        assert_eq!(dec.needed(), HEADER_LEN - 4);
        assert!(dec.push(&bytes[4..HEADER_LEN]).unwrap().is_none());
        assert_eq!(dec.needed(), 16);
        assert!(dec.push(&bytes[HEADER_LEN..HEADER_LEN + 10]).unwrap().is_none());
        assert_eq!(dec.needed(), 6);
        assert!(dec.push(&bytes[HEADER_LEN + 10..]).unwrap().is_some());
        assert_eq!(dec.needed(), HEADER_LEN);
    }

    #[test]
    fn consecutive_frames_decode_when_fed_separately() {
        let a = encode_frame(KIND_JSON, 1, b"{}");
        let b = encode_frame(KIND_BINARY, 2, &[9, 9]);
        let mut dec = FrameDecoder::new();
        assert_eq!(dec.push(&a).unwrap().unwrap().id, 1);
        assert_eq!(dec.push(&b).unwrap().unwrap().id, 2);
    }
}
