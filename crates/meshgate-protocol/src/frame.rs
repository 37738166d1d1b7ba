//! Record encoding/decoding utilities.
//!
//! Every exchange with the coordinator uses a fixed-length record. The body is
//! shifted by a per-record offset so that no encoded body byte collides with a
//! control value; this lets a receiver treat any control value it sees as a
//! genuine record boundary or handshake.
//!
//! ```text
//! +-------+--------+--------+--------+-------+---------------+----------+
//! | START | offset | addr+o | func+o | len+o | data[32] + o  | csum + o |
//! +-------+--------+--------+--------+-------+---------------+----------+
//! ```
//!
//! The checksum is the wrapping sum of the raw address, function, length and
//! data bytes.

use bytes::{Buf, BytesMut};

use crate::constants::*;
use crate::error::{EncodeError, FrameError};

/// A decoded record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Unit address (or [`GATEWAY_ADDRESS`]).
    pub address: u8,
    /// Gateway function.
    pub function: FunctionId,
    /// Meaningful data bytes (padding stripped).
    pub data: Vec<u8>,
}

impl Frame {
    /// Create a new frame.
    pub fn new(address: u8, function: FunctionId, data: Vec<u8>) -> Self {
        Frame {
            address,
            function,
            data,
        }
    }

    /// Payload as passed to [`encode`]: function byte followed by data.
    pub fn payload(&self) -> Vec<u8> {
        let mut payload = Vec::with_capacity(1 + self.data.len());
        payload.push(self.function.as_u8());
        payload.extend_from_slice(&self.data);
        payload
    }

    /// Encode this frame.
    pub fn encode(&self) -> Result<[u8; RECORD_LEN], EncodeError> {
        encode(self.address, &self.payload())
    }

    /// Class id and command id of an application payload, if present.
    pub fn class_header(&self) -> Option<(u8, u8)> {
        match self.function {
            FunctionId::ApplicationCommand | FunctionId::SendData if self.data.len() >= 2 => {
                Some((self.data[0], self.data[1]))
            }
            _ => None,
        }
    }
}

/// Wrapping byte sum used as the record checksum.
pub fn checksum(bytes: &[u8]) -> u8 {
    bytes.iter().fold(0u8, |acc, &b| acc.wrapping_add(b))
}

/// Pick an offset that does not occur in the raw body (checksum included) and
/// keeps `offset` and every shifted body byte off the reserved control values.
///
/// At most 36 values occur in the body and each excludes at most four shifts,
/// so a candidate always remains in practice.
fn choose_offset(body: &[u8]) -> Option<u8> {
    (0..=u8::MAX).find(|&offset| {
        !is_reserved(offset)
            && !body.contains(&offset)
            && body.iter().all(|&b| !is_reserved(b.wrapping_add(offset)))
    })
}

/// Encode a record for `address` carrying `payload` (function byte + data).
pub fn encode(address: u8, payload: &[u8]) -> Result<[u8; RECORD_LEN], EncodeError> {
    let Some((&function, data)) = payload.split_first() else {
        return Err(EncodeError::EmptyPayload);
    };
    if data.len() > DATA_CAPACITY {
        return Err(EncodeError::PayloadTooLong {
            max: DATA_CAPACITY + 1,
            actual: payload.len(),
        });
    }

    // Raw body plus checksum, before shifting.
    let mut raw = [0u8; RAW_BODY_LEN + 1];
    raw[0] = address;
    raw[1] = function;
    raw[2] = data.len() as u8;
    raw[3..3 + data.len()].copy_from_slice(data);
    raw[RAW_BODY_LEN] = checksum(&raw[..RAW_BODY_LEN]);

    let offset = choose_offset(&raw).ok_or(EncodeError::NoFreeOffset)?;

    let mut record = [0u8; RECORD_LEN];
    record[0] = START;
    record[1] = offset;
    for (dst, &b) in record[2..].iter_mut().zip(raw.iter()) {
        *dst = b.wrapping_add(offset);
    }
    Ok(record)
}

/// Decode one record from the start of `raw`.
///
/// Bytes beyond the first record are ignored.
pub fn decode(raw: &[u8]) -> Result<Frame, FrameError> {
    if raw.len() < RECORD_LEN {
        return Err(FrameError::Incomplete {
            expected: RECORD_LEN,
            actual: raw.len(),
        });
    }
    if raw[0] != START {
        return Err(FrameError::BadStart(raw[0]));
    }

    let offset = raw[1];
    let mut body = [0u8; RAW_BODY_LEN + 1];
    for (dst, &b) in body.iter_mut().zip(raw[2..RECORD_LEN].iter()) {
        *dst = b.wrapping_sub(offset);
    }

    let computed = checksum(&body[..RAW_BODY_LEN]);
    let carried = body[RAW_BODY_LEN];
    if computed != carried {
        return Err(FrameError::ChecksumMismatch {
            expected: computed,
            actual: carried,
        });
    }

    let function = FunctionId::from_u8(body[1]).ok_or(FrameError::UnknownCommand(body[1]))?;
    let len = body[2];
    if len as usize > DATA_CAPACITY {
        return Err(FrameError::BadLength(len));
    }

    Ok(Frame {
        address: body[0],
        function,
        data: body[3..3 + len as usize].to_vec(),
    })
}

// ============================================================================
// Link Reader
// ============================================================================

/// Something observed on the inbound side of the link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    /// Handshake: last record accepted.
    Ack,
    /// Handshake: last record rejected.
    Nak,
    /// Handshake: last record cancelled.
    Cancel,
    /// A valid record.
    Frame(Frame),
    /// A record that failed to decode.
    Corrupt(FrameError),
}

/// Splits inbound bytes into handshake bytes and records.
///
/// Holds at most the bytes of the record currently being received; anything
/// that is neither a control value nor part of a record is discarded.
#[derive(Debug, Default)]
pub struct FrameReader {
    /// Buffer for accumulating incoming data.
    buffer: BytesMut,
    /// Count of bytes discarded as line noise.
    discarded: u64,
}

impl FrameReader {
    /// Create a new reader.
    pub fn new() -> Self {
        FrameReader {
            buffer: BytesMut::with_capacity(RECORD_LEN * 2),
            discarded: 0,
        }
    }

    /// Add received data to the buffer.
    pub fn push(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Try to take the next event from the buffer.
    ///
    /// Returns `None` if the buffer is empty or holds only part of a record.
    pub fn next_event(&mut self) -> Option<LinkEvent> {
        loop {
            let first = *self.buffer.first()?;
            match first {
                ACK => {
                    self.buffer.advance(1);
                    return Some(LinkEvent::Ack);
                }
                NAK => {
                    self.buffer.advance(1);
                    return Some(LinkEvent::Nak);
                }
                CAN => {
                    self.buffer.advance(1);
                    return Some(LinkEvent::Cancel);
                }
                START => return self.take_record(),
                _ => {
                    self.buffer.advance(1);
                    self.discarded += 1;
                }
            }
        }
    }

    fn take_record(&mut self) -> Option<LinkEvent> {
        // A control value inside the record window means the record was cut
        // short and something else started.
        let window = self.buffer.len().min(RECORD_LEN);
        if let Some(pos) = self.buffer[1..window].iter().position(|&b| is_reserved(b)) {
            let truncated = pos + 1;
            self.buffer.advance(truncated);
            return Some(LinkEvent::Corrupt(FrameError::Incomplete {
                expected: RECORD_LEN,
                actual: truncated,
            }));
        }

        if self.buffer.len() < RECORD_LEN {
            return None;
        }

        let record = self.buffer.split_to(RECORD_LEN);
        Some(match decode(&record) {
            Ok(frame) => LinkEvent::Frame(frame),
            Err(err) => LinkEvent::Corrupt(err),
        })
    }

    /// Drop a partially received record once its deadline has passed.
    ///
    /// Returns the error describing the dropped bytes, if any were buffered.
    pub fn expire(&mut self) -> Option<FrameError> {
        if self.buffer.is_empty() {
            return None;
        }
        let actual = self.buffer.len();
        self.buffer.clear();
        Some(FrameError::Incomplete {
            expected: RECORD_LEN,
            actual,
        })
    }

    /// Get the number of buffered bytes.
    pub fn buffered_len(&self) -> usize {
        self.buffer.len()
    }

    /// Bytes discarded as noise since creation.
    pub fn discarded(&self) -> u64 {
        self.discarded
    }

    /// Clear the buffer.
    pub fn clear(&mut self) {
        self.buffer.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_decode() {
        let payload = [FUNC_SEND_DATA, 0x25, 0x01, 0xFF];
        let record = encode(5, &payload).expect("should encode");
        assert_eq!(record.len(), RECORD_LEN);
        assert_eq!(record[0], START);

        let frame = decode(&record).expect("should decode");
        assert_eq!(frame.address, 5);
        assert_eq!(frame.function, FunctionId::SendData);
        assert_eq!(frame.payload(), payload.to_vec());
        assert_eq!(frame.class_header(), Some((0x25, 0x01)));
    }

    #[test]
    fn test_body_avoids_control_bytes() {
        // Payload made of control values forces a non-trivial offset.
        let payload = [FUNC_SEND_DATA, START, ACK, NAK, CAN, 0x00];
        let record = encode(ACK, &payload).expect("should encode");
        assert!(!is_reserved(record[1]));
        assert!(record[2..].iter().all(|&b| !is_reserved(b)));
        assert_eq!(decode(&record).unwrap().payload(), payload.to_vec());
    }

    #[test]
    fn test_decode_short_buffer() {
        for len in 0..RECORD_LEN {
            let raw = vec![START; len];
            assert!(matches!(decode(&raw), Err(FrameError::Incomplete { .. })));
        }
    }

    /// Raw body of an encoded record, checksum included.
    fn unshift(record: &[u8; RECORD_LEN]) -> Vec<u8> {
        record[2..].iter().map(|b| b.wrapping_sub(record[1])).collect()
    }

    /// Data of `len` bytes that varies with the address.
    fn pattern(address: u8, len: usize) -> Vec<u8> {
        (0..len).map(|i| address.wrapping_mul(31).wrapping_add(i as u8 * 7)).collect()
    }

    #[test]
    fn test_encode_decode_every_address_and_length() {
        for address in 0..=u8::MAX {
            for len in 0..=DATA_CAPACITY {
                let mut payload = vec![FUNC_APPLICATION_COMMAND];
                payload.extend(pattern(address, len));
                let record = encode(address, &payload).expect("should encode");
                let frame = decode(&record).expect("should decode");
                assert_eq!(frame.address, address);
                assert_eq!(frame.payload(), payload);
            }
        }
    }

    #[test]
    fn test_offset_absent_from_raw_body() {
        let payloads: Vec<Vec<u8>> = vec![
            vec![FUNC_SEND_DATA, 0x25, 0x02],
            vec![FUNC_SEND_DATA, 0x25, 0x01, 0xFF],
            vec![FUNC_GET_INIT_DATA],
            vec![FUNC_APPLICATION_COMMAND, 0x00, 0x02, 0x03, 0x04, 0x05],
            (0..=DATA_CAPACITY as u8).collect(),
            vec![FUNC_SEND_DATA; DATA_CAPACITY + 1],
        ];
        for payload in payloads {
            for address in [0u8, 2, 0x7F, 0xFF] {
                let record = encode(address, &payload).expect("should encode");
                let raw = unshift(&record);
                assert!(
                    !raw.contains(&record[1]),
                    "offset 0x{:02X} occurs in raw body of {:?}",
                    record[1],
                    payload
                );
                assert!(!is_reserved(record[1]));
                assert!(record[2..].iter().all(|&b| !is_reserved(b)));
            }
        }
    }

    #[test]
    fn test_decode_tampered_checksum() {
        let mut record = encode(2, &[FUNC_SEND_DATA, 0x25, 0x02]).unwrap();
        record[RECORD_LEN - 1] = record[RECORD_LEN - 1].wrapping_add(1);
        assert!(matches!(
            decode(&record),
            Err(FrameError::ChecksumMismatch { .. })
        ));
    }

    #[test]
    fn test_decode_tampered_at_every_body_position() {
        for len in [0, 1, 5, DATA_CAPACITY] {
            let mut payload = vec![FUNC_SEND_DATA];
            payload.extend(pattern(9, len));
            let record = encode(9, &payload).unwrap();
            for pos in 2..RECORD_LEN {
                for delta in [1u8, 0x80, 0xFF] {
                    let mut tampered = record;
                    tampered[pos] = tampered[pos].wrapping_add(delta);
                    assert!(
                        matches!(decode(&tampered), Err(FrameError::ChecksumMismatch { .. })),
                        "byte {} +{} went unnoticed",
                        pos,
                        delta
                    );
                }
            }
        }
    }

    #[test]
    fn test_decode_unknown_function() {
        let record = encode(2, &[0x7E, 0x01]).unwrap();
        assert_eq!(decode(&record), Err(FrameError::UnknownCommand(0x7E)));
    }

    #[test]
    fn test_encode_rejects_oversized_payload() {
        let payload = vec![FUNC_SEND_DATA; DATA_CAPACITY + 2];
        assert!(matches!(
            encode(2, &payload),
            Err(EncodeError::PayloadTooLong { .. })
        ));
        assert_eq!(encode(2, &[]), Err(EncodeError::EmptyPayload));
    }

    #[test]
    fn test_reader_handshake_and_record() {
        let mut reader = FrameReader::new();
        let record = encode(7, &[FUNC_APPLICATION_COMMAND, 0x25, 0x03, 0x00]).unwrap();

        reader.push(&[ACK]);
        reader.push(&record[..10]);
        assert_eq!(reader.next_event(), Some(LinkEvent::Ack));
        assert_eq!(reader.next_event(), None);

        reader.push(&record[10..]);
        match reader.next_event() {
            Some(LinkEvent::Frame(frame)) => assert_eq!(frame.address, 7),
            other => panic!("expected frame, got {:?}", other),
        }
        assert_eq!(reader.buffered_len(), 0);
    }

    #[test]
    fn test_reader_skips_noise() {
        let mut reader = FrameReader::new();
        reader.push(&[0x42, 0x43, NAK]);
        assert_eq!(reader.next_event(), Some(LinkEvent::Nak));
        assert_eq!(reader.discarded(), 2);
    }

    #[test]
    fn test_reader_resyncs_after_truncated_record() {
        let mut reader = FrameReader::new();
        let first = encode(3, &[FUNC_APPLICATION_COMMAND, 0x25, 0x03, 0xFF]).unwrap();
        let second = encode(4, &[FUNC_APPLICATION_COMMAND, 0x25, 0x03, 0x00]).unwrap();

        reader.push(&first[..12]);
        reader.push(&second);
        assert!(matches!(
            reader.next_event(),
            Some(LinkEvent::Corrupt(FrameError::Incomplete { .. }))
        ));
        match reader.next_event() {
            Some(LinkEvent::Frame(frame)) => assert_eq!(frame.address, 4),
            other => panic!("expected frame, got {:?}", other),
        }
    }

    #[test]
    fn test_reader_expire_partial() {
        let mut reader = FrameReader::new();
        let record = encode(3, &[FUNC_SEND_DATA, 0x25]).unwrap();
        reader.push(&record[..5]);
        assert_eq!(reader.next_event(), None);
        assert!(matches!(reader.expire(), Some(FrameError::Incomplete { actual: 5, .. })));
        assert_eq!(reader.expire(), None);
    }
}
