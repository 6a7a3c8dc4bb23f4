use std::fmt::Display;

/// The two magic bytes every HiSLIP message starts with.
pub const PROLOGUE: [u8; 2] = *b"HS";

/// Size of the fixed message header in bytes.
pub const HEADER_SIZE: usize = 16;

/// The well-known TCP port of HiSLIP servers.
pub const DEFAULT_PORT: u16 = 4880;

/// Sub-address used when a client sends an `Initialize` without one.
pub const DEFAULT_SUBADDRESS: &str = "hislip0";

/// The version of the protocol.
/// A version always consists of a major and a minor part and is packed into
/// 16 bits on the wire (major in the upper byte).
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct ProtocolVersion {
    major: u8,
    minor: u8,
}

impl ProtocolVersion {
    /// Version 1.0 of the protocol
    pub const V1_0: ProtocolVersion = ProtocolVersion { major: 1, minor: 0 };

    pub const fn new(major: u8, minor: u8) -> ProtocolVersion {
        ProtocolVersion { major, minor }
    }

    /// Returns the latest supported version
    pub fn latest() -> ProtocolVersion {
        ProtocolVersion::V1_0
    }

    /// The major part of the version
    pub fn major(&self) -> u8 {
        self.major
    }

    /// The minor part of the version
    pub fn minor(&self) -> u8 {
        self.minor
    }

    /// The packed on-wire representation, e.g. `0x0100` for 1.0
    pub const fn to_u16(self) -> u16 {
        ((self.major as u16) << 8) | self.minor as u16
    }

    pub const fn from_u16(value: u16) -> ProtocolVersion {
        ProtocolVersion {
            major: (value >> 8) as u8,
            minor: value as u8,
        }
    }
}

#[test]
fn version_ordering() {
    assert!(ProtocolVersion::new(1, 0) < ProtocolVersion::new(1, 1));
    assert!(ProtocolVersion::new(2, 0) > ProtocolVersion::new(1, 0));
}

#[test]
fn version_packing() {
    assert_eq!(ProtocolVersion::V1_0.to_u16(), 0x0100);
    assert_eq!(ProtocolVersion::from_u16(0x0102), ProtocolVersion::new(1, 2));
}

impl Default for ProtocolVersion {
    fn default() -> Self {
        Self::V1_0
    }
}

impl Display for ProtocolVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

/// The kind of a message, transferred in the third byte of the header.
///
/// Type values that are not defined by HiSLIP 1.0 decode to [`MessageType::Unknown`]
/// so that a server can answer them with an `Error` instead of dropping the connection.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum MessageType {
    Initialize,
    InitializeResponse,
    FatalError,
    Error,
    AsyncLock,
    AsyncLockResponse,
    Data,
    DataEnd,
    DeviceClearComplete,
    DeviceClearAcknowledge,
    AsyncRemoteLocalControl,
    AsyncRemoteLocalResponse,
    Trigger,
    Interrupted,
    AsyncInterrupted,
    AsyncMaximumMessageSize,
    AsyncMaximumMessageSizeResponse,
    AsyncInitialize,
    AsyncInitializeResponse,
    AsyncDeviceClear,
    AsyncServiceRequest,
    AsyncStatusQuery,
    AsyncStatusResponse,
    AsyncDeviceClearAcknowledge,
    AsyncLockInfo,
    AsyncLockInfoResponse,
    Unknown(u8),
}

impl From<u8> for MessageType {
    fn from(value: u8) -> Self {
        match value {
            0 => MessageType::Initialize,
            1 => MessageType::InitializeResponse,
            2 => MessageType::FatalError,
            3 => MessageType::Error,
            4 => MessageType::AsyncLock,
            5 => MessageType::AsyncLockResponse,
            6 => MessageType::Data,
            7 => MessageType::DataEnd,
            8 => MessageType::DeviceClearComplete,
            9 => MessageType::DeviceClearAcknowledge,
            10 => MessageType::AsyncRemoteLocalControl,
            11 => MessageType::AsyncRemoteLocalResponse,
            12 => MessageType::Trigger,
            13 => MessageType::Interrupted,
            14 => MessageType::AsyncInterrupted,
            15 => MessageType::AsyncMaximumMessageSize,
            16 => MessageType::AsyncMaximumMessageSizeResponse,
            17 => MessageType::AsyncInitialize,
            18 => MessageType::AsyncInitializeResponse,
            19 => MessageType::AsyncDeviceClear,
            20 => MessageType::AsyncServiceRequest,
            21 => MessageType::AsyncStatusQuery,
            22 => MessageType::AsyncStatusResponse,
            23 => MessageType::AsyncDeviceClearAcknowledge,
            24 => MessageType::AsyncLockInfo,
            25 => MessageType::AsyncLockInfoResponse,
            other => MessageType::Unknown(other),
        }
    }
}

impl From<MessageType> for u8 {
    fn from(value: MessageType) -> Self {
        match value {
            MessageType::Initialize => 0,
            MessageType::InitializeResponse => 1,
            MessageType::FatalError => 2,
            MessageType::Error => 3,
            MessageType::AsyncLock => 4,
            MessageType::AsyncLockResponse => 5,
            MessageType::Data => 6,
            MessageType::DataEnd => 7,
            MessageType::DeviceClearComplete => 8,
            MessageType::DeviceClearAcknowledge => 9,
            MessageType::AsyncRemoteLocalControl => 10,
            MessageType::AsyncRemoteLocalResponse => 11,
            MessageType::Trigger => 12,
            MessageType::Interrupted => 13,
            MessageType::AsyncInterrupted => 14,
            MessageType::AsyncMaximumMessageSize => 15,
            MessageType::AsyncMaximumMessageSizeResponse => 16,
            MessageType::AsyncInitialize => 17,
            MessageType::AsyncInitializeResponse => 18,
            MessageType::AsyncDeviceClear => 19,
            MessageType::AsyncServiceRequest => 20,
            MessageType::AsyncStatusQuery => 21,
            MessageType::AsyncStatusResponse => 22,
            MessageType::AsyncDeviceClearAcknowledge => 23,
            MessageType::AsyncLockInfo => 24,
            MessageType::AsyncLockInfoResponse => 25,
            MessageType::Unknown(other) => other,
        }
    }
}

#[test]
fn message_type_values_are_stable() {
    for value in 0..=u8::MAX {
        assert_eq!(u8::from(MessageType::from(value)), value);
    }
    assert_eq!(MessageType::from(26), MessageType::Unknown(26));
    assert_eq!(u8::from(MessageType::AsyncInitialize), 17);
}

/// Codes carried in the control code of a `FatalError` message.
/// Values from 128 upwards are vendor specific.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum FatalErrorCode {
    Unidentified,
    PoorlyFormedHeader,
    ChannelsNotEstablished,
    InvalidInitializationSequence,
    MaximumClientsExceeded,
    /// The sub-address in `Initialize` is not served by this server.
    UnrecognizedSubaddress,
    /// The client requested a protocol version this server does not speak.
    UnsupportedVersion,
    Other(u8),
}

impl From<u8> for FatalErrorCode {
    fn from(value: u8) -> Self {
        match value {
            0 => FatalErrorCode::Unidentified,
            1 => FatalErrorCode::PoorlyFormedHeader,
            2 => FatalErrorCode::ChannelsNotEstablished,
            3 => FatalErrorCode::InvalidInitializationSequence,
            4 => FatalErrorCode::MaximumClientsExceeded,
            128 => FatalErrorCode::UnrecognizedSubaddress,
            129 => FatalErrorCode::UnsupportedVersion,
            other => FatalErrorCode::Other(other),
        }
    }
}

impl From<FatalErrorCode> for u8 {
    fn from(value: FatalErrorCode) -> Self {
        match value {
            FatalErrorCode::Unidentified => 0,
            FatalErrorCode::PoorlyFormedHeader => 1,
            FatalErrorCode::ChannelsNotEstablished => 2,
            FatalErrorCode::InvalidInitializationSequence => 3,
            FatalErrorCode::MaximumClientsExceeded => 4,
            FatalErrorCode::UnrecognizedSubaddress => 128,
            FatalErrorCode::UnsupportedVersion => 129,
            FatalErrorCode::Other(other) => other,
        }
    }
}

/// Codes carried in the control code of a (non-fatal) `Error` message.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ErrorCode {
    Unidentified,
    UnrecognizedMessageType,
    UnrecognizedControlCode,
    UnrecognizedVendorMessage,
    MessageTooLarge,
    Other(u8),
}

impl From<u8> for ErrorCode {
    fn from(value: u8) -> Self {
        match value {
            0 => ErrorCode::Unidentified,
            1 => ErrorCode::UnrecognizedMessageType,
            2 => ErrorCode::UnrecognizedControlCode,
            3 => ErrorCode::UnrecognizedVendorMessage,
            4 => ErrorCode::MessageTooLarge,
            other => ErrorCode::Other(other),
        }
    }
}

impl From<ErrorCode> for u8 {
    fn from(value: ErrorCode) -> Self {
        match value {
            ErrorCode::Unidentified => 0,
            ErrorCode::UnrecognizedMessageType => 1,
            ErrorCode::UnrecognizedControlCode => 2,
            ErrorCode::UnrecognizedVendorMessage => 3,
            ErrorCode::MessageTooLarge => 4,
            ErrorCode::Other(other) => other,
        }
    }
}

/// Parameter of an `Initialize` message: the client protocol version in the
/// upper 16 bits and the client vendor id in the lower 16 bits.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct InitializeParameter {
    pub version: ProtocolVersion,
    pub vendor_id: u16,
}

impl From<u32> for InitializeParameter {
    fn from(value: u32) -> Self {
        InitializeParameter {
            version: ProtocolVersion::from_u16((value >> 16) as u16),
            vendor_id: value as u16,
        }
    }
}

impl From<InitializeParameter> for u32 {
    fn from(value: InitializeParameter) -> Self {
        ((value.version.to_u16() as u32) << 16) | value.vendor_id as u32
    }
}

/// Parameter of an `InitializeResponse` message: the server protocol version in the
/// upper 16 bits and the session id in the lower 16 bits.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct InitializeResponseParameter {
    pub version: ProtocolVersion,
    pub session_id: u16,
}

impl From<u32> for InitializeResponseParameter {
    fn from(value: u32) -> Self {
        InitializeResponseParameter {
            version: ProtocolVersion::from_u16((value >> 16) as u16),
            session_id: value as u16,
        }
    }
}

impl From<InitializeResponseParameter> for u32 {
    fn from(value: InitializeResponseParameter) -> Self {
        ((value.version.to_u16() as u32) << 16) | value.session_id as u32
    }
}

#[test]
fn initialize_parameter_packing() {
    let parameter = InitializeParameter {
        version: ProtocolVersion::V1_0,
        vendor_id: 0x1234,
    };
    assert_eq!(u32::from(parameter), 0x0100_1234);
    assert_eq!(InitializeParameter::from(0x0100_1234), parameter);
}

/// The fixed-size part of every message.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Header {
    pub kind: MessageType,
    pub control_code: u8,
    pub parameter: u32,
    pub payload_length: u64,
}

/// A single HiSLIP message. Messages travel in both directions on both the
/// synchronous and the asynchronous channel.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Message {
    pub kind: MessageType,
    /// type specific flag or status
    pub control_code: u8,
    /// type specific value, e.g. the message id of `Data` messages
    pub parameter: u32,
    pub payload: Box<[u8]>,
}

impl Message {
    pub fn new(
        kind: MessageType,
        control_code: u8,
        parameter: u32,
        payload: impl Into<Box<[u8]>>,
    ) -> Message {
        Message {
            kind,
            control_code,
            parameter,
            payload: payload.into(),
        }
    }

    /// A message consisting of the header only
    pub fn without_payload(kind: MessageType, control_code: u8, parameter: u32) -> Message {
        Message {
            kind,
            control_code,
            parameter,
            payload: Box::default(),
        }
    }

    /// The header describing this message
    pub fn header(&self) -> Header {
        Header {
            kind: self.kind,
            control_code: self.control_code,
            parameter: self.parameter,
            payload_length: self.payload.len() as u64,
        }
    }

    pub fn initialize(version: ProtocolVersion, vendor_id: u16, subaddress: &str) -> Message {
        let parameter = InitializeParameter { version, vendor_id };
        Message::new(
            MessageType::Initialize,
            0,
            parameter.into(),
            subaddress.as_bytes(),
        )
    }

    pub fn initialize_response(
        overlap_mode: bool,
        version: ProtocolVersion,
        session_id: u16,
    ) -> Message {
        let parameter = InitializeResponseParameter {
            version,
            session_id,
        };
        Message::without_payload(
            MessageType::InitializeResponse,
            overlap_mode as u8,
            parameter.into(),
        )
    }

    pub fn async_initialize(session_id: u16) -> Message {
        Message::without_payload(MessageType::AsyncInitialize, 0, session_id as u32)
    }

    pub fn async_initialize_response(vendor_id: u16) -> Message {
        Message::without_payload(MessageType::AsyncInitializeResponse, 0, vendor_id as u32)
    }

    pub fn data(message_id: u32, payload: impl Into<Box<[u8]>>) -> Message {
        Message::new(MessageType::Data, 0, message_id, payload)
    }

    pub fn data_end(message_id: u32, payload: impl Into<Box<[u8]>>) -> Message {
        Message::new(MessageType::DataEnd, 0, message_id, payload)
    }

    /// A `FatalError` carrying a human readable explanation as payload
    pub fn fatal_error(code: FatalErrorCode, text: &str) -> Message {
        Message::new(MessageType::FatalError, code.into(), 0, text.as_bytes())
    }

    /// An `Error` carrying a human readable explanation as payload
    pub fn error(code: ErrorCode, text: &str) -> Message {
        Message::new(MessageType::Error, code.into(), 0, text.as_bytes())
    }

    pub fn async_maximum_message_size(size: u64) -> Message {
        Message::new(
            MessageType::AsyncMaximumMessageSize,
            0,
            0,
            size.to_be_bytes(),
        )
    }

    pub fn async_maximum_message_size_response(size: u64) -> Message {
        Message::new(
            MessageType::AsyncMaximumMessageSizeResponse,
            0,
            0,
            size.to_be_bytes(),
        )
    }

    /// Interprets the payload as the 8 byte size of the `AsyncMaximumMessageSize`
    /// family. Returns `None` when the payload has a different length.
    pub fn size_payload(&self) -> Option<u64> {
        let bytes: [u8; 8] = self.payload.as_ref().try_into().ok()?;
        Some(u64::from_be_bytes(bytes))
    }

    /// The payload as text, used for sub-addresses and error descriptions
    pub fn payload_text(&self) -> String {
        String::from_utf8_lossy(&self.payload).into_owned()
    }
}

#[test]
fn size_payload_requires_eight_bytes() {
    assert_eq!(
        Message::async_maximum_message_size(0x1_0000).size_payload(),
        Some(0x1_0000)
    );
    assert_eq!(Message::data(0, vec![1u8, 2, 3]).size_payload(), None);
}
