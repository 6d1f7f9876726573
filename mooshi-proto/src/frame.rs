//! Framing layer
//!
//! ```text
//! [sequence u8][op u8][payload][crc32 u32 LE]
//! ```
//!
//! The CRC covers sequence, op and payload. There is no length field: the
//! payload size follows from the op-code's node type, so the reader needs a
//! lookup from op byte to [`PayloadKind`].

use crate::crc::Crc32;
use crate::opcode::WRITE_FLAG;
use crate::{NodeType, ProtoError};

pub const HEADER_LEN: usize = 2;
pub const CRC_LEN: usize = 4;

/// Largest `STR`/`BIN` body accepted before the stream is considered corrupt
pub const MAX_VARIABLE_PAYLOAD: usize = 4096;

/// One complete protocol message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub sequence: u8,
    pub op: u8,
    pub payload: Vec<u8>,
}

impl Frame {
    /// Client -> meter: ask for the current value of `op_code`
    pub fn read_request(sequence: u8, op_code: u8) -> Self {
        Self { sequence, op: op_code, payload: Vec::new() }
    }

    /// Client -> meter: store `payload` in `op_code`
    pub fn write(sequence: u8, op_code: u8, payload: Vec<u8>) -> Self {
        Self { sequence, op: op_code | WRITE_FLAG, payload }
    }

    /// Meter -> client: current value of `op_code`
    pub fn value(sequence: u8, op_code: u8, payload: Vec<u8>) -> Self {
        Self { sequence, op: op_code, payload }
    }

    pub fn op_code(&self) -> u8 {
        self.op & !WRITE_FLAG
    }

    pub fn is_write(&self) -> bool {
        self.op & WRITE_FLAG != 0
    }

    pub fn to_bytes(&self, crc: &Crc32) -> Vec<u8> {
        let mut buf = Vec::with_capacity(HEADER_LEN + self.payload.len() + CRC_LEN);
        buf.push(self.sequence);
        buf.push(self.op);
        buf.extend_from_slice(&self.payload);
        let checksum = crc.calculate(&buf);
        buf.extend_from_slice(&checksum.to_le_bytes());
        buf
    }
}

/// Split an encoded frame into transport-sized writes
pub fn fragment(bytes: &[u8], max_len: usize) -> impl Iterator<Item = &[u8]> {
    bytes.chunks(max_len.max(1))
}

/// What follows the op byte of a frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadKind {
    /// Read request: no payload
    Empty,
    /// A value encoded per the node type
    Value(NodeType),
}

/// Reassembles frames out of notification fragments
#[derive(Debug, Default)]
pub struct FrameReader {
    buffer: Vec<u8>,
}

impl FrameReader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, fragment: &[u8]) {
        self.buffer.extend_from_slice(fragment);
    }

    /// Bytes waiting for the rest of a frame
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    pub fn clear(&mut self) {
        self.buffer.clear();
    }

    /// Pop the next complete frame from the buffer
    ///
    /// `Ok(None)` means more bytes are needed. On error the offending bytes
    /// are already gone: a bad checksum drops exactly the apparent frame, an
    /// op byte that cannot be delimited (or an absurd length) drops the
    /// whole buffer so reassembly restarts with the next fragment.
    pub fn next_frame<F>(&mut self, crc: &Crc32, kind_of: F) -> Result<Option<Frame>, ProtoError>
    where
        F: Fn(u8) -> Option<PayloadKind>,
    {
        if self.buffer.len() < HEADER_LEN {
            return Ok(None);
        }

        let op = self.buffer[1];
        let Some(kind) = kind_of(op) else {
            self.buffer.clear();
            return Err(ProtoError::UnknownOpCode(op));
        };

        let payload_len = match kind {
            PayloadKind::Empty => 0,
            PayloadKind::Value(node_type) => match node_type.wire_width() {
                Some(width) => width,
                None => {
                    if self.buffer.len() < HEADER_LEN + 2 {
                        return Ok(None);
                    }
                    let len = u16::from_le_bytes([self.buffer[2], self.buffer[3]]) as usize;
                    if len > MAX_VARIABLE_PAYLOAD {
                        self.buffer.clear();
                        return Err(ProtoError::Oversized(len));
                    }
                    2 + len
                }
            },
        };

        let total = HEADER_LEN + payload_len + CRC_LEN;
        if self.buffer.len() < total {
            return Ok(None);
        }

        let frame: Vec<u8> = self.buffer.drain(..total).collect();
        let body_end = HEADER_LEN + payload_len;
        let received = u32::from_le_bytes([
            frame[body_end],
            frame[body_end + 1],
            frame[body_end + 2],
            frame[body_end + 3],
        ]);
        let computed = crc.calculate(&frame[..body_end]);
        if received != computed {
            return Err(ProtoError::Checksum { received, computed });
        }

        Ok(Some(Frame {
            sequence: frame[0],
            op,
            payload: frame[HEADER_LEN..body_end].to_vec(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // op 4 is a U16 node, op 9 a STR node, nothing else is known
    fn kind_of(op: u8) -> Option<PayloadKind> {
        match op {
            4 => Some(PayloadKind::Value(NodeType::U16)),
            9 => Some(PayloadKind::Value(NodeType::Str)),
            _ => None,
        }
    }

    #[test]
    fn frame_layout() {
        let crc = Crc32::new();
        let bytes = Frame::value(7, 4, vec![0x34, 0x12]).to_bytes(&crc);
        assert_eq!(&bytes[..4], &[7, 4, 0x34, 0x12]);
        assert_eq!(bytes.len(), 8);
        assert_eq!(u32::from_le_bytes(bytes[4..].try_into().unwrap()), crc.calculate(&bytes[..4]));

        let write = Frame::write(0, 4, vec![1, 0]);
        assert_eq!(write.op, 0x84);
        assert_eq!(write.op_code(), 4);
        assert!(write.is_write());
    }

    #[test]
    fn reassembles_across_fragments() {
        let crc = Crc32::new();
        let text = vec![b'x'; 30];
        let mut payload = (text.len() as u16).to_le_bytes().to_vec();
        payload.extend_from_slice(&text);
        let bytes = Frame::value(1, 9, payload.clone()).to_bytes(&crc);

        let mut reader = FrameReader::new();
        let mut frames = Vec::new();
        for chunk in fragment(&bytes, 20) {
            reader.push(chunk);
            while let Some(frame) = reader.next_frame(&crc, kind_of).unwrap() {
                frames.push(frame);
            }
        }
        assert_eq!(frames, vec![Frame::value(1, 9, payload)]);
        assert_eq!(reader.buffered(), 0);
    }

    #[test]
    fn two_frames_in_one_fragment() {
        let crc = Crc32::new();
        let mut bytes = Frame::value(1, 4, vec![1, 0]).to_bytes(&crc);
        bytes.extend(Frame::value(2, 4, vec![2, 0]).to_bytes(&crc));

        let mut reader = FrameReader::new();
        reader.push(&bytes);
        assert_eq!(reader.next_frame(&crc, kind_of).unwrap().unwrap().sequence, 1);
        assert_eq!(reader.next_frame(&crc, kind_of).unwrap().unwrap().sequence, 2);
        assert_eq!(reader.next_frame(&crc, kind_of).unwrap(), None);
    }

    #[test]
    fn corrupted_checksum_is_dropped_and_reader_recovers() {
        let crc = Crc32::new();
        let mut bad = Frame::value(1, 4, vec![0x34, 0x12]).to_bytes(&crc);
        let last = bad.len() - 1;
        bad[last] ^= 0xFF;
        let good = Frame::value(2, 4, vec![0x78, 0x56]).to_bytes(&crc);

        let mut reader = FrameReader::new();
        reader.push(&bad);
        assert!(matches!(
            reader.next_frame(&crc, kind_of),
            Err(ProtoError::Checksum { .. })
        ));
        assert_eq!(reader.buffered(), 0);

        reader.push(&good);
        let frame = reader.next_frame(&crc, kind_of).unwrap().unwrap();
        assert_eq!(frame.payload, vec![0x78, 0x56]);
    }

    #[test]
    fn unknown_op_flushes_buffer() {
        let crc = Crc32::new();
        let mut reader = FrameReader::new();
        reader.push(&[0, 0x55, 1, 2, 3]);
        assert_eq!(
            reader.next_frame(&crc, kind_of),
            Err(ProtoError::UnknownOpCode(0x55))
        );
        assert_eq!(reader.buffered(), 0);
    }

    #[test]
    fn oversized_length_flushes_buffer() {
        let crc = Crc32::new();
        let mut reader = FrameReader::new();
        reader.push(&[0, 9, 0xFF, 0xFF, 1]);
        assert_eq!(
            reader.next_frame(&crc, kind_of),
            Err(ProtoError::Oversized(0xFFFF))
        );
        assert_eq!(reader.buffered(), 0);
    }

    #[test]
    fn waits_for_more_bytes() {
        let crc = Crc32::new();
        let bytes = Frame::value(0, 4, vec![1, 2]).to_bytes(&crc);
        let mut reader = FrameReader::new();
        reader.push(&bytes[..1]);
        assert_eq!(reader.next_frame(&crc, kind_of), Ok(None));
        reader.push(&bytes[1..5]);
        assert_eq!(reader.next_frame(&crc, kind_of), Ok(None));
        reader.push(&bytes[5..]);
        assert!(reader.next_frame(&crc, kind_of).unwrap().is_some());
    }

    #[test]
    fn read_requests_have_no_payload() {
        let crc = Crc32::new();
        let bytes = Frame::read_request(3, 4).to_bytes(&crc);
        assert_eq!(bytes.len(), HEADER_LEN + CRC_LEN);

        let mut reader = FrameReader::new();
        reader.push(&bytes);
        let frame = reader
            .next_frame(&crc, |_| Some(PayloadKind::Empty))
            .unwrap()
            .unwrap();
        assert_eq!(frame, Frame::read_request(3, 4));
    }
}
