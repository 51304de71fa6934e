//! Frame codec - hex-line wire format for relay payloads
//!
//! Pure encode/decode between raw payload bytes and the wire format:
//! one line of lowercase hex digits (two per payload byte) followed by a
//! single `\n` terminator. Hex text can never contain the terminator, so
//! no escaping is needed anywhere in the protocol.

use bytes::Bytes;

// ============================================================================
// Constants
// ============================================================================

/// Default maximum raw payload size accepted by a relay (5 MiB).
///
/// A payload of this size expands to 10 MiB of hex text on the wire.
pub const DEFAULT_MAX_PAYLOAD_LEN: usize = 5 * 1024 * 1024;

/// Frame terminator character.
pub(crate) const TERMINATOR: u8 = b'\n';

/// Maximum line length (hex characters, terminator excluded) for a given
/// raw payload bound.
///
/// Both the encoder's payload check and the reader's line scanner derive
/// their limit from this single definition, so the two bounds cannot
/// silently diverge.
pub const fn max_line_len(max_payload_len: usize) -> usize {
    max_payload_len * 2
}

/// Maximum on-wire frame length (terminator included) for a given raw
/// payload bound.
pub const fn max_frame_len(max_payload_len: usize) -> usize {
    max_line_len(max_payload_len) + 1
}

// ============================================================================
// Errors
// ============================================================================

/// Error types for frame encoding and decoding
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("malformed frame: {0}")]
    MalformedFrame(#[from] hex::FromHexError),

    #[error("frame too large: {size} hex characters (max: {max})")]
    FrameTooLarge { size: usize, max: usize },

    #[error("payload too large: {size} bytes (max: {max})")]
    PayloadTooLarge { size: usize, max: usize },
}

// ============================================================================
// Encode / Decode
// ============================================================================

/// Encode one payload into its wire frame.
///
/// Produces exactly `2 * payload.len()` lowercase hex characters followed
/// by one terminator. Total for every byte sequence within
/// `max_payload_len`; larger payloads are rejected up front.
pub fn encode_frame(payload: &[u8], max_payload_len: usize) -> Result<Vec<u8>, FrameError> {
    if payload.len() > max_payload_len {
        return Err(FrameError::PayloadTooLarge {
            size: payload.len(),
            max: max_payload_len,
        });
    }

    let hex_len = payload.len() * 2;
    let mut frame = vec![0u8; hex_len + 1];

    // Intentional .expect() - the destination is sized to exactly two hex
    // characters per input byte, so encode_to_slice cannot fail
    hex::encode_to_slice(payload, &mut frame[..hex_len])
        .expect("destination sized for hex expansion");
    frame[hex_len] = TERMINATOR;

    Ok(frame)
}

/// Decode one wire line (terminator already stripped) back into a payload.
///
/// Inverse of [`encode_frame`]: fails with [`FrameError::MalformedFrame`]
/// on non-hex characters or odd length, and with
/// [`FrameError::FrameTooLarge`] when the line exceeds the bound derived
/// from `max_payload_len`.
pub fn decode_frame(line: &[u8], max_payload_len: usize) -> Result<Bytes, FrameError> {
    if line.len() > max_line_len(max_payload_len) {
        return Err(FrameError::FrameTooLarge {
            size: line.len(),
            max: max_line_len(max_payload_len),
        });
    }

    let payload = hex::decode(line)?;
    Ok(Bytes::from(payload))
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    const MAX: usize = DEFAULT_MAX_PAYLOAD_LEN;

    #[test]
    fn test_encode_frame_shape() {
        let frame = encode_frame(b"hello", MAX).unwrap();

        // 2 hex characters per byte plus one terminator
        assert_eq!(frame.len(), 2 * 5 + 1);
        assert_eq!(frame, b"68656c6c6f\n");
        assert_eq!(*frame.last().unwrap(), b'\n');
    }

    #[test]
    fn test_encode_frame_is_lowercase() {
        let frame = encode_frame(&[0xDE, 0xAD, 0xBE, 0xEF], MAX).unwrap();
        assert_eq!(frame, b"deadbeef\n");
    }

    #[test]
    fn test_encode_empty_payload() {
        let frame = encode_frame(b"", MAX).unwrap();
        assert_eq!(frame, b"\n");

        let payload = decode_frame(b"", MAX).unwrap();
        assert!(payload.is_empty());
    }

    #[test]
    fn test_round_trip() {
        // Pseudo-random buffer spanning all byte values
        let mut state = 0x2545_f491_4f6c_dd1du64;
        let payload: Vec<u8> = (0..4096)
            .map(|_| {
                state ^= state << 13;
                state ^= state >> 7;
                state ^= state << 17;
                state as u8
            })
            .collect();

        let frame = encode_frame(&payload, MAX).unwrap();
        assert_eq!(frame.len(), payload.len() * 2 + 1);

        let decoded = decode_frame(&frame[..frame.len() - 1], MAX).unwrap();
        assert_eq!(decoded, payload);
    }

    #[test]
    fn test_decode_rejects_non_hex() {
        let result = decode_frame(b"68zz", MAX);
        assert!(matches!(result, Err(FrameError::MalformedFrame(_))));
    }

    #[test]
    fn test_decode_rejects_odd_length() {
        let result = decode_frame(b"686", MAX);
        assert!(matches!(result, Err(FrameError::MalformedFrame(_))));
    }

    #[test]
    fn test_encode_enforces_payload_bound() {
        let result = encode_frame(&[0u8; 5], 4);
        match result {
            Err(FrameError::PayloadTooLarge { size, max }) => {
                assert_eq!(size, 5);
                assert_eq!(max, 4);
            }
            other => panic!("expected PayloadTooLarge, got: {other:?}"),
        }
    }

    #[test]
    fn test_decode_enforces_frame_bound() {
        // 5 payload bytes encoded, decoded against a 4 byte bound
        let frame = encode_frame(&[0u8; 5], MAX).unwrap();
        let result = decode_frame(&frame[..frame.len() - 1], 4);
        match result {
            Err(FrameError::FrameTooLarge { size, max }) => {
                assert_eq!(size, 10);
                assert_eq!(max, max_line_len(4));
            }
            other => panic!("expected FrameTooLarge, got: {other:?}"),
        }
    }

    #[test]
    fn test_bounds_derive_consistently() {
        assert_eq!(max_frame_len(4), max_line_len(4) + 1);

        // A maximum-size payload encodes to exactly the maximum frame length
        let frame = encode_frame(&[0xffu8; 4], 4).unwrap();
        assert_eq!(frame.len(), max_frame_len(4));
    }
}
