// ===============================
// src/codec.rs
// ===============================
//
// Framing protokol DLL:
//   [u32 little-endian: panjang payload][payload JSON]
//
// - Decoder menampung byte parsial sampai satu frame lengkap tersedia.
// - Payload yang gagal di-deserialize di-skip (log), stream tetap jalan.
// - Panjang frame di atas MAX_FRAME_LEN dianggap pelanggaran protokol.
//
use std::marker::PhantomData;

use serde::{de::DeserializeOwned, Serialize};
use thiserror::Error;
use tracing::warn;

use crate::metrics::MALFORMED_FRAMES;

pub const LEN_PREFIX: usize = 4;
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("frame length {0} exceeds limit")]
    FrameTooLarge(usize),
    #[error("payload serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Serialize `msg` and prefix it with its byte length.
pub fn encode_frame<T: Serialize>(msg: &T) -> Result<Vec<u8>, CodecError> {
    let payload = serde_json::to_vec(msg)?;
    if payload.len() > MAX_FRAME_LEN {
        return Err(CodecError::FrameTooLarge(payload.len()));
    }
    let mut out = Vec::with_capacity(LEN_PREFIX + payload.len());
    out.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    out.extend_from_slice(&payload);
    Ok(out)
}

/// Incremental decoder: push raw socket bytes, pull decoded records.
pub struct FrameDecoder<T> {
    buf: Vec<u8>,
    // panjang frame ilegal yang sudah terlihat; sekali set, decoder mati
    violation: Option<usize>,
    _marker: PhantomData<fn() -> T>,
}

impl<T: DeserializeOwned> Default for FrameDecoder<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: DeserializeOwned> FrameDecoder<T> {
    pub fn new() -> Self {
        Self { buf: Vec::with_capacity(8192), violation: None, _marker: PhantomData }
    }

    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Protocol violation seen so far, if any.
    pub fn violation(&self) -> Option<CodecError> {
        self.violation.map(CodecError::FrameTooLarge)
    }

    /// Append `chunk` and decode every complete frame now available.
    /// A partial trailing frame stays buffered for the next call.
    ///
    /// Frames that precede an oversized header are still returned; the
    /// violation is then reported by `violation()` and by every later call.
    pub fn decode(&mut self, chunk: &[u8]) -> Result<Vec<T>, CodecError> {
        if let Some(len) = self.violation {
            return Err(CodecError::FrameTooLarge(len));
        }
        self.buf.extend_from_slice(chunk);

        let mut out = Vec::new();
        let mut pos = 0usize;
        loop {
            let rest = &self.buf[pos..];
            if rest.len() < LEN_PREFIX {
                break;
            }
            let len = u32::from_le_bytes([rest[0], rest[1], rest[2], rest[3]]) as usize;
            if len > MAX_FRAME_LEN {
                self.violation = Some(len);
                break;
            }
            if rest.len() < LEN_PREFIX + len {
                break;
            }

            let payload = &rest[LEN_PREFIX..LEN_PREFIX + len];
            match serde_json::from_slice::<T>(payload) {
                Ok(v) => out.push(v),
                Err(e) => {
                    MALFORMED_FRAMES.inc();
                    warn!(?e, len, "malformed frame skipped");
                }
            }
            pos += LEN_PREFIX + len;
        }

        if pos > 0 {
            self.buf.drain(..pos);
        }
        match self.violation {
            Some(len) if out.is_empty() => Err(CodecError::FrameTooLarge(len)),
            _ => Ok(out),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{EnforcementMessage, Event, EventType};

    fn sample_events() -> Vec<Event> {
        vec![
            Event::new("u1", EventType::OrderOpen, "EURUSD", 1.5, 1.25),
            Event::new("u2", EventType::OrderClose, "XAUUSD", 0.5, 2301.5),
            Event::new("u1", EventType::BalanceUpdate, "", 0.0, 10_000.0),
        ]
    }

    fn wire(events: &[Event]) -> Vec<u8> {
        events.iter().flat_map(|e| encode_frame(e).unwrap()).collect()
    }

    #[test]
    fn frame_prefix_is_little_endian_payload_length() {
        let msg = EnforcementMessage::new("u1", "close_position", "Rule violation: big", 4);
        let frame = encode_frame(&msg).unwrap();
        let len = u32::from_le_bytes(frame[..4].try_into().unwrap()) as usize;
        assert_eq!(len, frame.len() - 4);
        let payload: EnforcementMessage = serde_json::from_slice(&frame[4..]).unwrap();
        assert_eq!(payload, msg);
    }

    #[test]
    fn chunking_does_not_change_decoded_sequence() {
        let events = sample_events();
        let bytes = wire(&events);

        let mut whole = FrameDecoder::<Event>::new();
        let all_at_once = whole.decode(&bytes).unwrap();

        for chunk_size in [1usize, 2, 3, 5, 7, 64] {
            let mut dec = FrameDecoder::<Event>::new();
            let mut got = Vec::new();
            for chunk in bytes.chunks(chunk_size) {
                got.extend(dec.decode(chunk).unwrap());
            }
            assert_eq!(got, all_at_once, "chunk size {chunk_size}");
            assert_eq!(dec.buffered(), 0);
        }
        assert_eq!(all_at_once, events);
    }

    #[test]
    fn partial_frame_waits_for_more_bytes() {
        let frame = encode_frame(&sample_events()[0]).unwrap();
        let mut dec = FrameDecoder::<Event>::new();

        assert!(dec.decode(&frame[..2]).unwrap().is_empty());
        assert!(dec.decode(&frame[2..frame.len() - 1]).unwrap().is_empty());
        assert_eq!(dec.buffered(), frame.len() - 1);

        let out = dec.decode(&frame[frame.len() - 1..]).unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(dec.buffered(), 0);
    }

    #[test]
    fn malformed_payload_is_skipped_without_aborting_stream() {
        let events = sample_events();
        let mut bytes = encode_frame(&events[0]).unwrap();
        let junk = b"{not json";
        bytes.extend_from_slice(&(junk.len() as u32).to_le_bytes());
        bytes.extend_from_slice(junk);
        bytes.extend(encode_frame(&events[1]).unwrap());

        let mut dec = FrameDecoder::<Event>::new();
        let out = dec.decode(&bytes).unwrap();
        assert_eq!(out, vec![events[0].clone(), events[1].clone()]);
    }

    #[test]
    fn reencoding_decoded_frames_reproduces_bytes() {
        let bytes = wire(&sample_events());
        let decoded = FrameDecoder::<Event>::new().decode(&bytes).unwrap();
        assert_eq!(wire(&decoded), bytes);

        let msg = EnforcementMessage::new("u7", "restrict_symbol", "Rule violation: fx", 2);
        let frame = encode_frame(&msg).unwrap();
        let back = FrameDecoder::<EnforcementMessage>::new().decode(&frame).unwrap();
        assert_eq!(encode_frame(&back[0]).unwrap(), frame);
    }

    #[test]
    fn oversized_length_is_rejected() {
        let mut dec = FrameDecoder::<Event>::new();
        let bogus = ((MAX_FRAME_LEN + 1) as u32).to_le_bytes();
        assert!(matches!(dec.decode(&bogus), Err(CodecError::FrameTooLarge(_))));
    }

    #[test]
    fn frames_before_an_oversized_header_are_still_delivered() {
        let events = sample_events();
        let mut bytes = wire(&events[..2]);
        bytes.extend_from_slice(&((MAX_FRAME_LEN + 1) as u32).to_le_bytes());
        bytes.extend(encode_frame(&events[2]).unwrap());

        let mut dec = FrameDecoder::<Event>::new();
        let out = dec.decode(&bytes).unwrap();
        assert_eq!(out, events[..2].to_vec());
        assert!(matches!(dec.violation(), Some(CodecError::FrameTooLarge(n)) if n == MAX_FRAME_LEN + 1));
        // decoder stays dead, nothing after the bad header leaks out
        assert!(matches!(dec.decode(&[]), Err(CodecError::FrameTooLarge(_))));
    }

    #[test]
    fn empty_frame_is_malformed_but_harmless() {
        let mut bytes = 0u32.to_le_bytes().to_vec();
        bytes.extend(encode_frame(&sample_events()[2]).unwrap());
        let out = FrameDecoder::<Event>::new().decode(&bytes).unwrap();
        assert_eq!(out.len(), 1);
    }
}
