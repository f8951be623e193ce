//! Stream sub-frames.
//!
//! These travel inside the sealed payload of `Data` and `Ack` packets, so the
//! network never sees stream ids or sequence numbers.
//!
//! ```text
//! Data:  [StreamID (2B)][Seq (4B)][Ack (4B)][Cmd (1B)][Payload ...]
//! Ack:   [StreamID (2B)][Seq (4B)]
//! ```

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::{PacketError, STREAM_COMMAND_SIZE, STREAM_HEADER_SIZE};

/// Stream commands carried in the command byte of a [`StreamFrame`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum StreamCommand {
    /// Announces a new stream id to the peer.
    Open = 0x01,
    /// Ordered end of stream.
    Close = 0x02,
    /// Stream payload fragment.
    Data = 0x03,
}

impl TryFrom<u8> for StreamCommand {
    type Error = PacketError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(Self::Open),
            0x02 => Ok(Self::Close),
            0x03 => Ok(Self::Data),
            _ => Err(PacketError::UnknownCommand(value)),
        }
    }
}

/// One sequenced stream frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamFrame {
    pub stream_id: u16,
    pub seq: u32,
    /// Reserved; always zero on send. Acknowledgments travel in [`AckFrame`]s.
    pub ack: u32,
    pub command: StreamCommand,
    pub payload: Bytes,
}

impl StreamFrame {
    /// Fixed bytes before the payload.
    pub const OVERHEAD: usize = STREAM_HEADER_SIZE + STREAM_COMMAND_SIZE;

    pub fn new(stream_id: u16, seq: u32, command: StreamCommand, payload: Bytes) -> Self {
        Self {
            stream_id,
            seq,
            ack: 0,
            command,
            payload,
        }
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(Self::OVERHEAD + self.payload.len());
        buf.put_u16(self.stream_id);
        buf.put_u32(self.seq);
        buf.put_u32(self.ack);
        buf.put_u8(self.command as u8);
        buf.put_slice(&self.payload);
        buf.freeze()
    }

    pub fn decode(mut bytes: Bytes) -> Result<Self, PacketError> {
        if bytes.len() < Self::OVERHEAD {
            return Err(PacketError::TooShort(bytes.len(), Self::OVERHEAD));
        }

        let stream_id = bytes.get_u16();
        let seq = bytes.get_u32();
        let ack = bytes.get_u32();
        let command = StreamCommand::try_from(bytes.get_u8())?;

        if stream_id == 0 {
            return Err(PacketError::Malformed("stream id 0"));
        }

        Ok(Self {
            stream_id,
            seq,
            ack,
            command,
            payload: bytes,
        })
    }
}

/// Acknowledges exactly one sequence number of one stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AckFrame {
    pub stream_id: u16,
    pub seq: u32,
}

impl AckFrame {
    /// Encoded size in bytes.
    pub const SIZE: usize = 6;

    pub fn encode(&self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        buf[0..2].copy_from_slice(&self.stream_id.to_be_bytes());
        buf[2..6].copy_from_slice(&self.seq.to_be_bytes());
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self, PacketError> {
        if buf.len() < Self::SIZE {
            return Err(PacketError::TooShort(buf.len(), Self::SIZE));
        }

        let stream_id = u16::from_be_bytes([buf[0], buf[1]]);
        let seq = u32::from_be_bytes([buf[2], buf[3], buf[4], buf[5]]);

        Ok(Self { stream_id, seq })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stream_frame_layout() {
        let frame = StreamFrame::new(3, 0x0102_0304, StreamCommand::Data, Bytes::from_static(b"hi"));
        let bytes = frame.encode();
        assert_eq!(
            &bytes[..],
            &[0, 3, 1, 2, 3, 4, 0, 0, 0, 0, 0x03, b'h', b'i']
        );
        assert_eq!(StreamFrame::decode(bytes).unwrap(), frame);
    }

    #[test]
    fn stream_frame_without_payload() {
        let frame = StreamFrame::new(1, 1, StreamCommand::Open, Bytes::new());
        let decoded = StreamFrame::decode(frame.encode()).unwrap();
        assert_eq!(decoded.command, StreamCommand::Open);
        assert!(decoded.payload.is_empty());
    }

    #[test]
    fn stream_frame_too_short() {
        let bytes = Bytes::from(vec![0u8; StreamFrame::OVERHEAD - 1]);
        assert_eq!(
            StreamFrame::decode(bytes),
            Err(PacketError::TooShort(10, 11))
        );
    }

    #[test]
    fn stream_frame_rejects_unknown_command() {
        let mut raw = StreamFrame::new(1, 1, StreamCommand::Data, Bytes::new())
            .encode()
            .to_vec();
        raw[10] = 0x09;
        assert_eq!(
            StreamFrame::decode(Bytes::from(raw)),
            Err(PacketError::UnknownCommand(0x09))
        );
    }

    #[test]
    fn stream_frame_rejects_zero_stream_id() {
        let raw = Bytes::from_static(&[0, 0, 0, 0, 0, 1, 0, 0, 0, 0, 0x03]);
        assert!(matches!(
            StreamFrame::decode(raw),
            Err(PacketError::Malformed(_))
        ));
    }

    #[test]
    fn ack_frame() {
        let ack = AckFrame {
            stream_id: 0xABCD,
            seq: 77,
        };
        let buf = ack.encode();
        assert_eq!(AckFrame::decode(&buf).unwrap(), ack);
        assert_eq!(
            AckFrame::decode(&buf[..5]),
            Err(PacketError::TooShort(5, AckFrame::SIZE))
        );
    }
}
