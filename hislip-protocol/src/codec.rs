/// Read and write implementations for the protocol messages
use std::io::{self, Read, Write};

use crate::{
    error::ReadError,
    protocol::{HEADER_SIZE, Header, Message, MessageType, PROLOGUE},
};

impl Header {
    /// Decodes a header from the first [`HEADER_SIZE`] bytes of `bytes`.
    ///
    /// This is the only validity check of the framing: a buffer that is too short
    /// or that does not start with the prologue is rejected, everything else is
    /// accepted (unknown message types included).
    pub fn decode(bytes: &[u8]) -> Result<Header, ReadError> {
        if bytes.len() < HEADER_SIZE {
            return Err(ReadError::TruncatedHeader { got: bytes.len() });
        }
        if bytes[..2] != PROLOGUE {
            return Err(ReadError::InvalidPrologue([bytes[0], bytes[1]]));
        }
        Ok(Header {
            kind: MessageType::from(bytes[2]),
            control_code: bytes[3],
            parameter: u32::from_be_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]),
            payload_length: u64::from_be_bytes([
                bytes[8], bytes[9], bytes[10], bytes[11], bytes[12], bytes[13], bytes[14],
                bytes[15],
            ]),
        })
    }

    pub fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        buf[..2].copy_from_slice(&PROLOGUE);
        buf[2] = self.kind.into();
        buf[3] = self.control_code;
        buf[4..8].copy_from_slice(&self.parameter.to_be_bytes());
        buf[8..].copy_from_slice(&self.payload_length.to_be_bytes());
        buf
    }

    pub fn from_reader(reader: &mut impl Read) -> Result<Header, ReadError> {
        let mut buf = [0u8; HEADER_SIZE];
        reader.read_exact(&mut buf)?;
        Header::decode(&buf)
    }

    /// Reads exactly `payload_length` bytes following this header.
    /// Lengths above `max_payload_size` are refused before anything is allocated.
    pub fn read_payload(
        &self,
        reader: &mut impl Read,
        max_payload_size: u64,
    ) -> Result<Box<[u8]>, ReadError> {
        if self.payload_length > max_payload_size {
            return Err(ReadError::TooManyBytes {
                max: max_payload_size,
                got: self.payload_length,
            });
        }
        let mut payload = vec![0_u8; self.payload_length as usize].into_boxed_slice();
        reader.read_exact(&mut payload[..])?;
        Ok(payload)
    }
}

impl Message {
    pub fn from_reader(
        reader: &mut impl Read,
        max_payload_size: u64,
    ) -> Result<Message, ReadError> {
        let header = Header::from_reader(reader)?;
        let payload = header.read_payload(reader, max_payload_size)?;
        Ok(Message {
            kind: header.kind,
            control_code: header.control_code,
            parameter: header.parameter,
            payload,
        })
    }

    pub fn write_to(&self, writer: &mut impl Write) -> io::Result<()> {
        writer.write_all(&self.header().to_bytes())?;
        writer.write_all(&self.payload)
    }

    /// The complete encoded message, header followed by payload
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(HEADER_SIZE + self.payload.len());
        out.extend_from_slice(&self.header().to_bytes());
        out.extend_from_slice(&self.payload);
        out
    }
}

#[cfg(feature = "tokio")]
pub use framed::{Inbound, MessageCodec};

#[cfg(feature = "tokio")]
mod framed {
    use std::io;

    use bytes::{Buf, BufMut, BytesMut};
    use tokio_util::codec::{Decoder, Encoder};

    use crate::{
        error::ReadError,
        protocol::{HEADER_SIZE, Header, Message},
    };

    /// A decoded item. Malformed headers are yielded as `Err` items instead of
    /// decoder errors, so that a framed stream keeps running after them.
    pub type Inbound = Result<Message, ReadError>;

    /// [`tokio_util::codec`] implementation of the message framing.
    ///
    /// On a malformed header the codec discards the [`HEADER_SIZE`] bytes that were
    /// inspected and continues with whatever follows. A declared payload length above
    /// the configured maximum is a decoder error and ends the stream.
    #[derive(Debug, Clone)]
    pub struct MessageCodec {
        max_payload_size: u64,
    }

    impl MessageCodec {
        pub fn new(max_payload_size: u64) -> MessageCodec {
            MessageCodec { max_payload_size }
        }

        pub fn max_payload_size(&self) -> u64 {
            self.max_payload_size
        }
    }

    impl Decoder for MessageCodec {
        type Item = Inbound;
        type Error = ReadError;

        fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Inbound>, ReadError> {
            if src.len() < HEADER_SIZE {
                src.reserve(HEADER_SIZE - src.len());
                return Ok(None);
            }
            let header = match Header::decode(&src[..HEADER_SIZE]) {
                Ok(header) => header,
                Err(err) => {
                    src.advance(HEADER_SIZE);
                    return Ok(Some(Err(err)));
                }
            };
            if header.payload_length > self.max_payload_size {
                return Err(ReadError::TooManyBytes {
                    max: self.max_payload_size,
                    got: header.payload_length,
                });
            }
            let frame_len = HEADER_SIZE + header.payload_length as usize;
            if src.len() < frame_len {
                src.reserve(frame_len - src.len());
                return Ok(None);
            }
            src.advance(HEADER_SIZE);
            let payload = src.split_to(header.payload_length as usize);
            Ok(Some(Ok(Message {
                kind: header.kind,
                control_code: header.control_code,
                parameter: header.parameter,
                payload: Box::from(&payload[..]),
            })))
        }
    }

    impl Encoder<Message> for MessageCodec {
        type Error = io::Error;

        fn encode(&mut self, item: Message, dst: &mut BytesMut) -> Result<(), io::Error> {
            dst.reserve(HEADER_SIZE + item.payload.len());
            dst.put_slice(&item.header().to_bytes());
            dst.put_slice(&item.payload);
            Ok(())
        }
    }

}

#[cfg(test)]
mod test {
    use crate::error::ReadError;
    use crate::protocol::{
        ErrorCode, FatalErrorCode, HEADER_SIZE, Header, Message, MessageType, ProtocolVersion,
    };
    use std::io::Cursor;

    const DEFAULT_MAX_PAYLOAD_SIZE: u64 = 1024;

    #[test]
    fn write_initialize() {
        let mut out = Vec::new();
        Message::initialize(ProtocolVersion::V1_0, 0x1234, "hislip0")
            .write_to(&mut out)
            .unwrap();
        let mut expected = b"HS\x00\x00\x01\x00\x12\x34".to_vec();
        expected.extend_from_slice(&7u64.to_be_bytes());
        expected.extend_from_slice(b"hislip0");
        assert_eq!(out, expected);
    }

    #[test]
    fn read_initialize_response() {
        let mut data = b"HS\x01\x01\x01\x00\x00\x05".to_vec();
        data.extend_from_slice(&0u64.to_be_bytes());
        let mut cursor = Cursor::new(data);
        let message = Message::from_reader(&mut cursor, DEFAULT_MAX_PAYLOAD_SIZE).unwrap();
        assert_eq!(message, Message::initialize_response(true, ProtocolVersion::V1_0, 5));
    }

    #[test]
    fn round_trip() {
        let messages = [
            Message::initialize(ProtocolVersion::V1_0, 0x1234, "hislip0"),
            Message::async_initialize(7),
            Message::data(0xffff_ff00, b"*RST".to_vec()),
            Message::data_end(0xffff_ff02, vec![0u8; 1024]),
            Message::async_maximum_message_size(0x10_0000),
            Message::fatal_error(FatalErrorCode::UnsupportedVersion, "version 2.0"),
            Message::error(ErrorCode::MessageTooLarge, ""),
            Message::new(MessageType::Unknown(0x80), 0xff, u32::MAX, Vec::<u8>::new()),
        ];
        for message in messages {
            let mut cursor = Cursor::new(message.to_bytes());
            let decoded = Message::from_reader(&mut cursor, DEFAULT_MAX_PAYLOAD_SIZE).unwrap();
            assert_eq!(decoded, message);
        }
    }

    #[test]
    fn invalid_prologue() {
        for prologue in [*b"XS", *b"HX", *b"hs", [0, 0]] {
            let mut data = Message::data_end(1, b"abc".to_vec()).to_bytes();
            data[..2].copy_from_slice(&prologue);
            match Header::decode(&data) {
                Err(ReadError::InvalidPrologue(p)) => assert_eq!(p, prologue),
                other => panic!("expected InvalidPrologue, got {:?}", other),
            }
        }
    }

    #[test]
    fn truncated_header() {
        let data = Message::async_initialize(1).to_bytes();
        let err = Header::decode(&data[..HEADER_SIZE - 1]).unwrap_err();
        assert!(err.is_format_error());
        match err {
            ReadError::TruncatedHeader { got } => assert_eq!(got, HEADER_SIZE - 1),
            other => panic!("expected TruncatedHeader, got {:?}", other),
        }
    }

    #[test]
    fn too_many_bytes() {
        let data = Message::data_end(1, vec![0u8; 1025]).to_bytes();
        let mut cursor = Cursor::new(data);
        let err = Message::from_reader(&mut cursor, DEFAULT_MAX_PAYLOAD_SIZE).unwrap_err();
        assert!(!err.is_format_error());
        match err {
            ReadError::TooManyBytes { max, got } => {
                assert_eq!(max, 1024);
                assert_eq!(got, 1025);
            }
            other => panic!("expected TooManyBytes, got {:?}", other),
        }
    }

    #[test]
    fn truncated_payload_is_io_error() {
        let data = Message::data_end(1, b"abcdef".to_vec()).to_bytes();
        let mut cursor = Cursor::new(&data[..data.len() - 2]);
        match Message::from_reader(&mut cursor, DEFAULT_MAX_PAYLOAD_SIZE) {
            Err(ReadError::IoError(err)) => {
                assert_eq!(err.kind(), std::io::ErrorKind::UnexpectedEof)
            }
            other => panic!("expected IoError, got {:?}", other),
        }
    }
}
