//! # HiSLIP Client
//!
//! A client for HiSLIP instrument servers: performs the channel handshake and
//! exchanges commands and responses with the instrument behind a sub-address.
//!
//! ## Overview
//!
//! A HiSLIP session consists of a synchronous channel carrying commands and
//! responses and an optional asynchronous channel for out-of-band requests
//! (device clear, status queries, message size negotiation). [`HislipClient::connect`]
//! opens the synchronous channel, [`HislipClient::open_async`] adds the asynchronous one.
//!
//! For details on the message format, see the [`hislip_protocol`](https://docs.rs/hislip-protocol/) crate.
//!
//! ## Basic Usage
//!
//! ```ignore
//! use hislip_client::HislipClient;
//! use std::time::Duration;
//!
//! let mut client = HislipClient::connect("127.0.0.1:4880", "hislip0", Duration::from_secs(2)).await?;
//! println!("Session {} (server version {})", client.session_id(), client.server_version());
//!
//! let idn = client.query(b"*IDN?\n").await?;
//! println!("{}", String::from_utf8_lossy(&idn));
//!
//! client.open_async().await?;
//! client.negotiate_max_message_size(1024 * 1024).await?;
//! client.device_clear().await?;
//! client.disconnect().await;
//! ```
//!
//! ## Related Crates
//!
//! - [`hislip_server`](https://docs.rs/hislip-server/) - Server implementation
//! - [`hislip_protocol`](https://docs.rs/hislip-protocol/) - Message encoding/decoding
use std::{error::Error, fmt::Display, io, net::SocketAddr, time::Duration};

use futures::{SinkExt, StreamExt};
use hislip_protocol::{
    ErrorCode, FatalErrorCode, InitializeResponseParameter, Message, MessageType,
    ProtocolVersion, codec::MessageCodec, error::ReadError,
};
use tokio::{
    net::{TcpStream, ToSocketAddrs},
    time::timeout,
};
use tokio_util::codec::Framed;

/// Vendor id sent in `Initialize`.
pub const CLIENT_VENDOR_ID: u16 = u16::from_be_bytes(*b"RS");

/// Message id of the first command after the handshake and after each device clear.
pub const FIRST_MESSAGE_ID: u32 = 0xffff_ff00;

/// Largest response payload accepted before the size is negotiated.
const DEFAULT_MAX_PAYLOAD: u64 = 5 * 1024 * 1024;

type Channel = Framed<TcpStream, MessageCodec>;

/// Failures of a command exchange on an established session.
#[derive(Debug)]
pub enum ClientError {
    Io(io::Error),
    Read(ReadError),
    /// No answer within the configured timeout
    Timeout(Duration),
    /// The server closed the channel
    Closed,
    /// The server reported a fatal error, the session is gone
    Fatal { code: FatalErrorCode, text: String },
    /// The server reported a non-fatal error
    Error { code: ErrorCode, text: String },
    Unexpected(MessageType),
    /// The operation needs the asynchronous channel, see [`HislipClient::open_async`]
    AsyncChannelNotOpen,
}

impl From<io::Error> for ClientError {
    fn from(value: io::Error) -> Self {
        ClientError::Io(value)
    }
}

impl From<ReadError> for ClientError {
    fn from(value: ReadError) -> Self {
        ClientError::Read(value)
    }
}

impl Display for ClientError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ClientError::Io(error) => write!(f, "IO error: {}", error),
            ClientError::Read(error) => write!(f, "Invalid message: {}", error),
            ClientError::Timeout(after) => write!(f, "No response after {:?}", after),
            ClientError::Closed => write!(f, "Connection closed by server"),
            ClientError::Fatal { code, text } => {
                write!(f, "Fatal error {:?} reported by server: {}", code, text)
            }
            ClientError::Error { code, text } => {
                write!(f, "Error {:?} reported by server: {}", code, text)
            }
            ClientError::Unexpected(kind) => write!(f, "Unexpected {:?} message", kind),
            ClientError::AsyncChannelNotOpen => write!(f, "Asynchronous channel is not open"),
        }
    }
}

impl Error for ClientError {}

/// Failures while establishing a channel.
#[derive(Debug)]
pub enum ConnectError {
    /// The TCP connection could not be established
    Io(io::Error),
    /// The server answered the handshake with `FatalError`
    Refused { code: FatalErrorCode, text: String },
    /// The handshake exchange failed
    Handshake(ClientError),
}

impl From<io::Error> for ConnectError {
    fn from(value: io::Error) -> Self {
        ConnectError::Io(value)
    }
}

impl From<ClientError> for ConnectError {
    fn from(value: ClientError) -> Self {
        match value {
            ClientError::Fatal { code, text } => ConnectError::Refused { code, text },
            other => ConnectError::Handshake(other),
        }
    }
}

impl Display for ConnectError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectError::Io(error) => write!(f, "Could not connect: {}", error),
            ConnectError::Refused { code, text } => {
                write!(f, "Server refused the session ({:?}): {}", code, text)
            }
            ConnectError::Handshake(error) => write!(f, "Handshake failed: {}", error),
        }
    }
}

impl Error for ConnectError {}

/// HiSLIP client bound to one session on a server.
pub struct HislipClient {
    addr: SocketAddr,
    limit: Duration,
    sync: Channel,
    asynchronous: Option<Channel>,
    session_id: u16,
    overlap_mode: bool,
    server_version: ProtocolVersion,
    server_vendor_id: Option<u16>,
    message_id: u32,
    max_message_size: u64,
}

impl HislipClient {
    /// Opens the synchronous channel of a new session on `subaddress`.
    ///
    /// Every network exchange of the returned client, including this handshake,
    /// waits at most `limit` for the server.
    pub async fn connect(
        addr: impl ToSocketAddrs,
        subaddress: &str,
        limit: Duration,
    ) -> Result<HislipClient, ConnectError> {
        let tcp = match timeout(limit, TcpStream::connect(addr)).await {
            Ok(tcp) => tcp?,
            Err(_) => return Err(ClientError::Timeout(limit).into()),
        };
        tcp.set_nodelay(true)?;
        let addr = tcp.peer_addr()?;
        log::info!("Connected to {}, initializing {}", addr, subaddress);

        let mut sync = Framed::new(tcp, MessageCodec::new(DEFAULT_MAX_PAYLOAD));
        send(
            &mut sync,
            Message::initialize(ProtocolVersion::V1_0, CLIENT_VENDOR_ID, subaddress),
            limit,
        )
        .await?;
        let response = expect(&mut sync, MessageType::InitializeResponse, limit).await?;
        let parameter = InitializeResponseParameter::from(response.parameter);
        log::info!(
            "Opened session {} (server version {}, overlapped {})",
            parameter.session_id,
            parameter.version,
            response.control_code != 0
        );
        Ok(HislipClient {
            addr,
            limit,
            sync,
            asynchronous: None,
            session_id: parameter.session_id,
            overlap_mode: response.control_code != 0,
            server_version: parameter.version,
            server_vendor_id: None,
            message_id: FIRST_MESSAGE_ID,
            max_message_size: DEFAULT_MAX_PAYLOAD,
        })
    }

    pub fn session_id(&self) -> u16 {
        self.session_id
    }

    pub fn overlap_mode(&self) -> bool {
        self.overlap_mode
    }

    pub fn server_version(&self) -> ProtocolVersion {
        self.server_version
    }

    /// Size limit for a single message agreed with the server
    pub fn max_message_size(&self) -> u64 {
        self.max_message_size
    }

    /// Opens the asynchronous channel of the session.
    ///
    /// # Returns
    ///
    /// The vendor id of the server. Calling this again returns the cached id.
    pub async fn open_async(&mut self) -> Result<u16, ConnectError> {
        if let Some(vendor_id) = self.server_vendor_id {
            return Ok(vendor_id);
        }
        let tcp = match timeout(self.limit, TcpStream::connect(self.addr)).await {
            Ok(tcp) => tcp?,
            Err(_) => return Err(ClientError::Timeout(self.limit).into()),
        };
        tcp.set_nodelay(true)?;
        let mut channel = Framed::new(tcp, MessageCodec::new(DEFAULT_MAX_PAYLOAD));
        send(
            &mut channel,
            Message::async_initialize(self.session_id),
            self.limit,
        )
        .await?;
        let response = expect(
            &mut channel,
            MessageType::AsyncInitializeResponse,
            self.limit,
        )
        .await?;
        // the vendor id occupies the lower 16 bits
        let vendor_id = (response.parameter & 0xffff) as u16;
        log::info!(
            "Session {}: asynchronous channel open (server vendor {:#06x})",
            self.session_id,
            vendor_id
        );
        self.asynchronous = Some(channel);
        self.server_vendor_id = Some(vendor_id);
        Ok(vendor_id)
    }

    /// Proposes `size` as maximum message size and returns the size the server agreed to.
    pub async fn negotiate_max_message_size(&mut self, size: u64) -> Result<u64, ClientError> {
        let response = self
            .async_exchange(
                Message::async_maximum_message_size(size),
                MessageType::AsyncMaximumMessageSizeResponse,
            )
            .await?;
        let agreed = response
            .size_payload()
            .ok_or(ClientError::Unexpected(response.kind))?;
        log::debug!("Maximum message size {} (proposed {})", agreed, size);
        self.max_message_size = agreed;
        let codec_max = agreed.max(DEFAULT_MAX_PAYLOAD);
        *self.sync.codec_mut() = MessageCodec::new(codec_max);
        Ok(agreed)
    }

    /// Sends `command` without waiting for a response.
    ///
    /// Commands longer than the negotiated maximum message size are split into
    /// `Data` messages followed by a final `DataEnd`.
    pub async fn send(&mut self, command: &[u8]) -> Result<u32, ClientError> {
        let message_id = self.message_id;
        self.message_id = self.message_id.wrapping_add(2);
        let chunk_size = usize::try_from(self.max_message_size)
            .unwrap_or(usize::MAX)
            .max(1);
        let chunk_count = command.len().div_ceil(chunk_size).max(1);
        log::debug!(
            "Sending command {:#x} ({} bytes, {} messages)",
            message_id,
            command.len(),
            chunk_count
        );
        log::trace!("Command: {:02x?}", command);
        if command.is_empty() {
            return send(
                &mut self.sync,
                Message::data_end(message_id, Vec::<u8>::new()),
                self.limit,
            )
            .await
            .map(|()| message_id);
        }
        for (index, chunk) in command.chunks(chunk_size).enumerate() {
            let message = if index + 1 < chunk_count {
                Message::data(message_id, chunk)
            } else {
                Message::data_end(message_id, chunk)
            };
            send(&mut self.sync, message, self.limit).await?;
        }
        Ok(message_id)
    }

    /// Sends `command` and collects the response up to and including its `DataEnd`.
    pub async fn query(&mut self, command: &[u8]) -> Result<Vec<u8>, ClientError> {
        let message_id = self.send(command).await?;
        let mut response = Vec::new();
        loop {
            let message = receive(&mut self.sync, self.limit).await?;
            match message.kind {
                MessageType::Data | MessageType::DataEnd if message.parameter != message_id => {
                    log::warn!(
                        "Dropping response to message {:#x}, waiting for {:#x}",
                        message.parameter,
                        message_id
                    );
                }
                MessageType::Data => response.extend_from_slice(&message.payload),
                MessageType::DataEnd => {
                    response.extend_from_slice(&message.payload);
                    log::trace!("Response: {:02x?}", response);
                    return Ok(response);
                }
                _ => return Err(unexpected(message)),
            }
        }
    }

    /// Clears the device: announces the clear on the asynchronous channel and
    /// completes it on the synchronous one. Message ids restart afterwards.
    pub async fn device_clear(&mut self) -> Result<(), ClientError> {
        self.async_exchange(
            Message::without_payload(MessageType::AsyncDeviceClear, 0, 0),
            MessageType::AsyncDeviceClearAcknowledge,
        )
        .await?;
        send(
            &mut self.sync,
            Message::without_payload(
                MessageType::DeviceClearComplete,
                self.overlap_mode as u8,
                0,
            ),
            self.limit,
        )
        .await?;
        expect(&mut self.sync, MessageType::DeviceClearAcknowledge, self.limit).await?;
        self.message_id = FIRST_MESSAGE_ID;
        log::info!("Session {}: device cleared", self.session_id);
        Ok(())
    }

    /// Queries the instrument status over the asynchronous channel.
    pub async fn status_query(&mut self) -> Result<Box<[u8]>, ClientError> {
        let last = self.message_id.wrapping_sub(2);
        let response = self
            .async_exchange(
                Message::without_payload(MessageType::AsyncStatusQuery, 0, last),
                MessageType::AsyncStatusResponse,
            )
            .await?;
        Ok(response.payload)
    }

    /// Sends a remote/local control request with the given control code.
    pub async fn remote_local_control(&mut self, code: u8) -> Result<Box<[u8]>, ClientError> {
        let last = self.message_id.wrapping_sub(2);
        let response = self
            .async_exchange(
                Message::without_payload(MessageType::AsyncRemoteLocalControl, code, last),
                MessageType::AsyncRemoteLocalResponse,
            )
            .await?;
        Ok(response.payload)
    }

    /// Closes both channels. Shutdown failures are logged and otherwise ignored.
    pub async fn disconnect(mut self) {
        if let Some(mut channel) = self.asynchronous.take()
            && let Err(e) = channel.close().await
        {
            log::debug!("Closing asynchronous channel failed: {}", e);
        }
        if let Err(e) = self.sync.close().await {
            log::debug!("Closing synchronous channel failed: {}", e);
        }
        log::info!("Session {}: disconnected", self.session_id);
    }

    async fn async_exchange(
        &mut self,
        message: Message,
        response: MessageType,
    ) -> Result<Message, ClientError> {
        let channel = self
            .asynchronous
            .as_mut()
            .ok_or(ClientError::AsyncChannelNotOpen)?;
        send(channel, message, self.limit).await?;
        expect(channel, response, self.limit).await
    }
}

async fn send(channel: &mut Channel, message: Message, limit: Duration) -> Result<(), ClientError> {
    log::debug!(
        "Sending {:?} (control code {}, parameter {:#x}, {} bytes)",
        message.kind,
        message.control_code,
        message.parameter,
        message.payload.len()
    );
    match timeout(limit, channel.send(message)).await {
        Ok(result) => Ok(result?),
        Err(_) => Err(ClientError::Timeout(limit)),
    }
}

async fn receive(channel: &mut Channel, limit: Duration) -> Result<Message, ClientError> {
    let message = match timeout(limit, channel.next()).await {
        Err(_) => return Err(ClientError::Timeout(limit)),
        Ok(None) => return Err(ClientError::Closed),
        Ok(Some(received)) => received??,
    };
    log::debug!(
        "Received {:?} (control code {}, parameter {:#x}, {} bytes)",
        message.kind,
        message.control_code,
        message.parameter,
        message.payload.len()
    );
    Ok(message)
}

async fn expect(
    channel: &mut Channel,
    kind: MessageType,
    limit: Duration,
) -> Result<Message, ClientError> {
    let message = receive(channel, limit).await?;
    if message.kind == kind {
        Ok(message)
    } else {
        Err(unexpected(message))
    }
}

fn unexpected(message: Message) -> ClientError {
    match message.kind {
        MessageType::FatalError => ClientError::Fatal {
            code: FatalErrorCode::from(message.control_code),
            text: message.payload_text(),
        },
        MessageType::Error => ClientError::Error {
            code: ErrorCode::from(message.control_code),
            text: message.payload_text(),
        },
        kind => ClientError::Unexpected(kind),
    }
}
