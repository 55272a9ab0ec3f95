// ABOUTME: Wire codec for IEC 60870-5-104 APCI frames (I/S/U) over TCP
// ABOUTME: Provides an incremental-read size oracle plus decode/encode for a complete frame

use bytes::{BufMut, Bytes, BytesMut};
use num_enum::TryFromPrimitive;
use thiserror::Error;

/// Fixed start-of-frame marker for every APDU.
const START_OCTET: u8 = 0x68;

/// The length octet counts only the four control octets plus payload, so the
/// smallest legal frame (an S- or U-frame, no payload) has length 4.
const MIN_APDU_LENGTH: u8 = 4;

/// Largest length octet representable in a single byte.
const MAX_APDU_LENGTH: u8 = 253;

/// Sequence numbers live in a modulo-0x8000 space.
pub const SEQ_MODULUS: u16 = 0x8000;

/// Errors raised while decoding a frame. Never raised by `encode`, which only
/// ever receives already-valid `Apdu` values.
#[derive(Debug, Error, PartialEq, Eq, Clone, Copy)]
pub enum CodecError {
    #[error("invalid start octet: {0:#04x}, expected {START_OCTET:#04x}")]
    InvalidStartOctet(u8),

    #[error("invalid APDU length octet: {0} (must be {MIN_APDU_LENGTH}..={MAX_APDU_LENGTH})")]
    InvalidLength(u8),

    #[error("unrecognized U-frame function code: {0:#04x}")]
    UnknownFunction(u8),

    #[error("malformed S-frame control octets: {0:#04x} {1:#04x}, expected 0x01 0x00")]
    MalformedSupervisory(u8, u8),
}

/// One of the three APCI frame kinds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Apdu {
    /// Carries one ASDU. `send_seq`/`recv_seq` are 15-bit counters.
    I {
        send_seq: u16,
        recv_seq: u16,
        payload: Bytes,
    },
    /// Acknowledges without carrying data.
    S { recv_seq: u16 },
    /// Unnumbered control frame.
    U(UFunction),
}

/// Single-byte U-frame function codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive)]
#[repr(u8)]
pub enum UFunction {
    StartDtAct = 0x07,
    StartDtCon = 0x0B,
    StopDtAct = 0x13,
    StopDtCon = 0x23,
    TestFrAct = 0x43,
    TestFrCon = 0x83,
}

/// Returns the total byte length of the next frame given however much of it
/// has been buffered so far.
///
/// With fewer than two bytes buffered the true length isn't knowable yet, so
/// this returns a lower bound (2) guaranteed to exceed `prefix.len()`; a
/// caller should read more bytes and call again. Once the start octet and
/// length octet are both present, the real total length is returned.
pub fn next_apdu_size(prefix: &[u8]) -> Result<usize, CodecError> {
    if prefix.len() < 2 {
        return Ok(2);
    }
    if prefix[0] != START_OCTET {
        return Err(CodecError::InvalidStartOctet(prefix[0]));
    }
    let length = prefix[1];
    if length < MIN_APDU_LENGTH || length > MAX_APDU_LENGTH {
        return Err(CodecError::InvalidLength(length));
    }
    Ok(2 + length as usize)
}

/// Decodes exactly one complete frame. `frame` must be precisely
/// `next_apdu_size(frame)` bytes long.
pub fn decode(frame: &[u8]) -> Result<Apdu, CodecError> {
    if frame[0] != START_OCTET {
        return Err(CodecError::InvalidStartOctet(frame[0]));
    }
    let length = frame[1];
    if length < MIN_APDU_LENGTH || length > MAX_APDU_LENGTH {
        return Err(CodecError::InvalidLength(length));
    }

    let control = &frame[2..6];
    let payload = &frame[6..];

    if control[0] & 0x01 == 0 {
        let send_seq = u16::from_le_bytes([control[0], control[1]]) >> 1;
        let recv_seq = u16::from_le_bytes([control[2], control[3]]) >> 1;
        return Ok(Apdu::I {
            send_seq,
            recv_seq,
            payload: Bytes::copy_from_slice(payload),
        });
    }

    if control[0] & 0x03 == 0x01 {
        if control[0] != 0x01 || control[1] != 0x00 {
            return Err(CodecError::MalformedSupervisory(control[0], control[1]));
        }
        let recv_seq = u16::from_le_bytes([control[2], control[3]]) >> 1;
        return Ok(Apdu::S { recv_seq });
    }

    let function = UFunction::try_from(control[0]).map_err(|_| CodecError::UnknownFunction(control[0]))?;
    Ok(Apdu::U(function))
}

/// Encodes a frame, producing a complete length-prefixed wire representation.
pub fn encode(apdu: &Apdu) -> BytesMut {
    match apdu {
        Apdu::I {
            send_seq,
            recv_seq,
            payload,
        } => {
            let mut buf = BytesMut::with_capacity(6 + payload.len());
            buf.put_u8(START_OCTET);
            buf.put_u8(4 + payload.len() as u8);
            buf.put_u16_le(send_seq << 1);
            buf.put_u16_le(recv_seq << 1);
            buf.extend_from_slice(payload);
            buf
        }
        Apdu::S { recv_seq } => {
            let mut buf = BytesMut::with_capacity(6);
            buf.put_u8(START_OCTET);
            buf.put_u8(4);
            buf.put_u8(0x01);
            buf.put_u8(0x00);
            buf.put_u16_le(recv_seq << 1);
            buf
        }
        Apdu::U(function) => {
            let mut buf = BytesMut::with_capacity(6);
            buf.put_u8(START_OCTET);
            buf.put_u8(4);
            buf.put_u8(*function as u8);
            buf.put_u8(0);
            buf.put_u8(0);
            buf.put_u8(0);
            buf
        }
    }
}

/// Increments a sequence number with wraparound at the modulus.
pub fn seq_next(n: u16) -> u16 {
    (n + 1) % SEQ_MODULUS
}

/// Number of steps from `from` to `to`, walking forward with wraparound.
pub fn seq_distance(from: u16, to: u16) -> u16 {
    if to >= from {
        to - from
    } else {
        SEQ_MODULUS - from + to
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn next_apdu_size_needs_two_bytes_before_committing() {
        assert_eq!(next_apdu_size(&[]).unwrap(), 2);
        assert_eq!(next_apdu_size(&[0x68]).unwrap(), 2);
    }

    #[test]
    fn next_apdu_size_reports_total_length_once_known() {
        // start, length=4 (an S- or U-frame with no payload)
        assert_eq!(next_apdu_size(&[0x68, 0x04]).unwrap(), 6);
        // start, length=9 (an I-frame with 5 bytes of payload)
        assert_eq!(next_apdu_size(&[0x68, 0x09]).unwrap(), 11);
    }

    #[test]
    fn next_apdu_size_rejects_bad_start_octet() {
        assert_eq!(
            next_apdu_size(&[0x00, 0x04]),
            Err(CodecError::InvalidStartOctet(0x00))
        );
    }

    #[test]
    fn next_apdu_size_rejects_out_of_range_length() {
        assert_eq!(
            next_apdu_size(&[0x68, 0x03]),
            Err(CodecError::InvalidLength(0x03))
        );
    }

    #[test]
    fn decode_startdt_act() {
        let frame = [0x68, 0x04, 0x07, 0x00, 0x00, 0x00];
        assert_eq!(decode(&frame).unwrap(), Apdu::U(UFunction::StartDtAct));
    }

    #[test]
    fn decode_rejects_unknown_ufunction() {
        let frame = [0x68, 0x04, 0xFF, 0x00, 0x00, 0x00];
        assert_eq!(decode(&frame), Err(CodecError::UnknownFunction(0xFF)));
    }

    #[test]
    fn decode_s_frame_acknowledging_one() {
        // N_R = 1 -> shifted left one bit -> 0x02, 0x00 little-endian
        let frame = [0x68, 0x04, 0x01, 0x00, 0x02, 0x00];
        assert_eq!(decode(&frame).unwrap(), Apdu::S { recv_seq: 1 });
    }

    #[test]
    fn decode_rejects_malformed_supervisory_octets() {
        let frame = [0x68, 0x04, 0x01, 0x05, 0x02, 0x00];
        assert_eq!(
            decode(&frame),
            Err(CodecError::MalformedSupervisory(0x01, 0x05))
        );
    }

    #[test]
    fn decode_i_frame_with_payload() {
        // send_seq=0, recv_seq=0, payload = [0xAA, 0xBB, 0xCC]
        let frame = [0x68, 0x07, 0x00, 0x00, 0x00, 0x00, 0xAA, 0xBB, 0xCC];
        let apdu = decode(&frame).unwrap();
        assert_eq!(
            apdu,
            Apdu::I {
                send_seq: 0,
                recv_seq: 0,
                payload: Bytes::from_static(&[0xAA, 0xBB, 0xCC]),
            }
        );
    }

    #[test]
    fn encode_decode_roundtrip_for_each_kind() {
        let cases = [
            Apdu::U(UFunction::StartDtAct),
            Apdu::U(UFunction::TestFrCon),
            Apdu::S { recv_seq: 42 },
            Apdu::I {
                send_seq: 100,
                recv_seq: 200,
                payload: Bytes::from_static(b"hello"),
            },
        ];
        for apdu in cases {
            let encoded = encode(&apdu);
            assert_eq!(decode(&encoded).unwrap(), apdu);
        }
    }

    #[test]
    fn seq_distance_handles_wraparound() {
        assert_eq!(seq_distance(0x7FFE, 0x0001), 3);
        assert_eq!(seq_distance(5, 5), 0);
        assert_eq!(seq_distance(5, 8), 3);
    }

    #[test]
    fn seq_next_wraps_at_modulus() {
        assert_eq!(seq_next(SEQ_MODULUS - 1), 0);
        assert_eq!(seq_next(10), 11);
    }
}
