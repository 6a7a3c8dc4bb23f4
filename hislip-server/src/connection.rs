//! The protocol state machine driving a single connection.
//!
//! A connection starts in [`ConnectionState::AwaitingInitialize`]. An `Initialize`
//! message turns it into the synchronous channel of a new session
//! ([`ConnectionState::SessionActive`]), an `AsyncInitialize` message into the
//! asynchronous channel of an existing one ([`ConnectionState::AsyncAttached`]).
//! [`ConnectionState::Closed`] and [`ConnectionState::FatalError`] are terminal.
use std::{
    error::Error,
    fmt::Display,
    io,
    sync::Arc,
    time::{Duration, Instant},
};

use futures::{SinkExt, StreamExt};
use hislip_protocol::{
    DEFAULT_SUBADDRESS, ErrorCode, FatalErrorCode, InitializeParameter, Message, MessageType,
    ProtocolVersion,
    codec::MessageCodec,
    error::ReadError,
};
use tokio::{
    io::{AsyncRead, AsyncWrite},
    time::timeout,
};
use tokio_util::codec::Framed;

use crate::{
    Subaddress,
    server::{Config, Shared},
    session::{Binding, ConnectionId, Session, SessionId},
};

/// The only protocol version this server speaks.
pub const SERVER_PROTOCOL_VERSION: ProtocolVersion = ProtocolVersion::V1_0;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ConnectionState {
    AwaitingInitialize,
    /// `Initialize` named a known sub-address, version and resources are checked next
    Negotiating,
    /// Synchronous channel of a session
    SessionActive,
    /// Asynchronous channel of a session
    AsyncAttached,
    Closed,
    FatalError,
}

impl ConnectionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ConnectionState::Closed | ConnectionState::FatalError)
    }
}

/// Failures that end a connection without a protocol level answer.
#[derive(Debug)]
pub enum ConnectionError {
    Write(io::Error),
    WriteTimeout(Duration),
}

impl Display for ConnectionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionError::Write(error) => write!(f, "Write failed: {}", error),
            ConnectionError::WriteTimeout(after) => {
                write!(f, "Write timed out after {:?}", after)
            }
        }
    }
}

impl Error for ConnectionError {}

struct Bound {
    session: SessionId,
    handler: Arc<dyn Subaddress>,
}

pub struct Connection<S> {
    id: ConnectionId,
    shared: Arc<Shared>,
    framed: Framed<S, MessageCodec>,
    state: ConnectionState,
    bound: Option<Bound>,
    opened: Instant,
}

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub(crate) fn new(shared: Arc<Shared>, id: ConnectionId, stream: S) -> Connection<S> {
        let codec = MessageCodec::new(shared.config.payload_size_max);
        Connection {
            id,
            shared,
            framed: Framed::new(stream, codec),
            state: ConnectionState::AwaitingInitialize,
            bound: None,
            opened: Instant::now(),
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// The session this connection is a channel of, if any
    pub fn session_id(&self) -> Option<SessionId> {
        self.bound.as_ref().map(|bound| bound.session)
    }

    fn config(&self) -> &Config {
        &self.shared.config
    }

    /// Processes messages in arrival order until the connection reaches a terminal state.
    pub async fn run(mut self) -> ConnectionState {
        while !self.state.is_terminal() {
            let next = match timeout(self.config().message_timeout, self.framed.next()).await {
                Ok(next) => next,
                Err(_) => {
                    if self.state == ConnectionState::AwaitingInitialize
                        && self.opened.elapsed() >= self.config().liveness_timeout
                    {
                        log::warn!("Connection {}: no handshake, closing", self.id);
                        self.close(ConnectionState::Closed);
                    } else {
                        log::trace!("Connection {}: read timeout", self.id);
                    }
                    continue;
                }
            };
            let result = match next {
                None => {
                    log::info!("Connection {}: client closed connection", self.id);
                    self.close(ConnectionState::Closed);
                    Ok(())
                }
                Some(Ok(Ok(message))) => self.handle_message(message).await,
                Some(Ok(Err(err))) => {
                    log::warn!(
                        "Connection {}: skipping malformed message header: {}",
                        self.id,
                        err
                    );
                    Ok(())
                }
                Some(Err(ReadError::TooManyBytes { max, got })) => {
                    self.payload_too_large(max, got).await
                }
                Some(Err(err)) => {
                    log::error!("Connection {}: read failed: {}", self.id, err);
                    self.close(ConnectionState::Closed);
                    Ok(())
                }
            };
            if let Err(err) = result {
                log::error!("Connection {}: {}", self.id, err);
                self.close(ConnectionState::Closed);
            }
        }
        self.state
    }

    /// Applies a single message to the state machine.
    pub async fn handle_message(&mut self, message: Message) -> Result<(), ConnectionError> {
        log::debug!(
            "Connection {}: received {:?} (control code {}, parameter {:#x}, {} bytes) in state {:?}",
            self.id,
            message.kind,
            message.control_code,
            message.parameter,
            message.payload.len(),
            self.state
        );
        log::trace!("Payload: {:02x?}", &message.payload[..]);

        use ConnectionState as State;
        use MessageType as Kind;
        match (self.state, message.kind) {
            (State::Closed | State::FatalError, _) => Ok(()),
            (_, Kind::FatalError) => {
                log::error!(
                    "Connection {}: client reported fatal error {:?}: {}",
                    self.id,
                    FatalErrorCode::from(message.control_code),
                    message.payload_text()
                );
                self.close(State::FatalError);
                Ok(())
            }
            (_, Kind::Error) => {
                log::warn!(
                    "Connection {}: client reported error {:?}: {}",
                    self.id,
                    ErrorCode::from(message.control_code),
                    message.payload_text()
                );
                self.close(State::Closed);
                Ok(())
            }
            (State::AwaitingInitialize, Kind::Initialize) => self.initialize(message).await,
            (State::AwaitingInitialize, Kind::AsyncInitialize) => {
                self.async_initialize(message).await
            }
            (State::AwaitingInitialize, kind) => {
                let text = format!("{:?} before Initialize", kind);
                self.fatal(FatalErrorCode::InvalidInitializationSequence, &text)
                    .await
            }
            (_, kind @ (Kind::Initialize | Kind::AsyncInitialize)) => {
                let text = format!("{:?} on an initialized connection", kind);
                self.fatal(FatalErrorCode::InvalidInitializationSequence, &text)
                    .await
            }
            (State::SessionActive, _) => self.sync_message(message).await,
            (State::AsyncAttached, _) => self.async_message(message).await,
            (State::Negotiating, _) => Ok(()),
        }
    }

    async fn initialize(&mut self, message: Message) -> Result<(), ConnectionError> {
        let parameter = InitializeParameter::from(message.parameter);
        let text = message.payload_text();
        let subaddress = match text.trim_end_matches('\0') {
            "" => DEFAULT_SUBADDRESS,
            name => name,
        };
        log::info!(
            "Connection {}: Initialize for {} (client version {}, vendor {:#06x})",
            self.id,
            subaddress,
            parameter.version,
            parameter.vendor_id
        );

        let handler = match self.shared.registry.lookup(subaddress) {
            Ok(handler) => handler,
            Err(err) => {
                return self
                    .fatal(FatalErrorCode::UnrecognizedSubaddress, &err.to_string())
                    .await;
            }
        };
        self.state = ConnectionState::Negotiating;

        if parameter.version != SERVER_PROTOCOL_VERSION {
            let text = format!("Unsupported protocol version {}", parameter.version);
            return self.fatal(FatalErrorCode::UnsupportedVersion, &text).await;
        }

        let overlap_mode = self.config().overlap_mode;
        let binding = Binding {
            subaddress: subaddress.to_string(),
            protocol_version: SERVER_PROTOCOL_VERSION,
            overlap_mode,
            sync_channel: self.id,
            max_message_size: self.config().payload_size_max,
        };
        let session = match self.shared.sessions.allocate(binding) {
            Ok(session) => session,
            Err(err) => {
                return self
                    .fatal(FatalErrorCode::MaximumClientsExceeded, &err.to_string())
                    .await;
            }
        };
        self.bound = Some(Bound { session, handler });
        self.state = ConnectionState::SessionActive;
        log::info!(
            "Connection {}: opened session {} on {}",
            self.id,
            session,
            subaddress
        );
        self.send(Message::initialize_response(
            overlap_mode,
            SERVER_PROTOCOL_VERSION,
            session,
        ))
        .await
    }

    async fn async_initialize(&mut self, message: Message) -> Result<(), ConnectionError> {
        let Ok(session) = SessionId::try_from(message.parameter) else {
            let text = format!("Invalid session id {}", message.parameter);
            return self
                .fatal(FatalErrorCode::InvalidInitializationSequence, &text)
                .await;
        };
        let attached = match self.shared.sessions.attach_async(session, self.id) {
            Ok(attached) => attached,
            Err(err) => {
                return self
                    .fatal(FatalErrorCode::InvalidInitializationSequence, &err.to_string())
                    .await;
            }
        };
        // the bound sub-address cannot disappear, the registry is immutable while serving
        let handler = match self.shared.registry.lookup(attached.subaddress()) {
            Ok(handler) => handler,
            Err(err) => {
                return self
                    .fatal(FatalErrorCode::Unidentified, &err.to_string())
                    .await;
            }
        };
        self.bound = Some(Bound { session, handler });
        self.state = ConnectionState::AsyncAttached;
        log::info!(
            "Connection {}: attached as asynchronous channel of session {}",
            self.id,
            session
        );
        let vendor_id = self.config().vendor_id;
        self.send(Message::async_initialize_response(vendor_id)).await
    }

    /// Messages on the synchronous channel of an established session
    async fn sync_message(&mut self, message: Message) -> Result<(), ConnectionError> {
        let Some((session, handler)) = self.current_session() else {
            return self
                .fatal(FatalErrorCode::Unidentified, "Session has been closed")
                .await;
        };
        match message.kind {
            MessageType::Data | MessageType::DataEnd => {
                if session.clear_pending() {
                    log::debug!(
                        "Session {}: discarding message {:#x} during device clear",
                        session.id(),
                        message.parameter
                    );
                    return Ok(());
                }
                let end = message.kind == MessageType::DataEnd;
                match handler.handle_sync(&message.payload, end) {
                    Ok(response) if response.is_empty() => Ok(()),
                    Ok(response) => {
                        self.send_data(message.parameter, &response, session.max_message_size())
                            .await
                    }
                    Err(err) => {
                        log::warn!("Session {}: handler failed: {}", session.id(), err);
                        self.send(Message::error(ErrorCode::Unidentified, err.message()))
                            .await
                    }
                }
            }
            MessageType::DeviceClearComplete => {
                match self.shared.sessions.take_clear_pending(session.id()) {
                    Ok(true) => log::info!("Session {}: device clear complete", session.id()),
                    Ok(false) => log::debug!(
                        "Session {}: DeviceClearComplete without pending clear",
                        session.id()
                    ),
                    Err(err) => log::debug!("Connection {}: {}", self.id, err),
                }
                self.send(Message::without_payload(
                    MessageType::DeviceClearAcknowledge,
                    session.overlap_mode() as u8,
                    0,
                ))
                .await
            }
            kind => self.unsupported(kind, "synchronous").await,
        }
    }

    /// Messages on the asynchronous channel of an established session
    async fn async_message(&mut self, message: Message) -> Result<(), ConnectionError> {
        let Some((session, handler)) = self.current_session() else {
            return self
                .fatal(FatalErrorCode::Unidentified, "Session has been closed")
                .await;
        };
        match message.kind {
            MessageType::AsyncMaximumMessageSize => {
                let Some(proposed) = message.size_payload() else {
                    return self
                        .send(Message::error(
                            ErrorCode::Unidentified,
                            "AsyncMaximumMessageSize expects an 8 byte payload",
                        ))
                        .await;
                };
                let agreed = proposed.min(self.config().payload_size_max);
                if self
                    .shared
                    .sessions
                    .set_max_message_size(session.id(), agreed)
                    .is_err()
                {
                    return self
                        .fatal(FatalErrorCode::Unidentified, "Session has been closed")
                        .await;
                }
                log::debug!(
                    "Session {}: maximum message size {} (client proposed {})",
                    session.id(),
                    agreed,
                    proposed
                );
                self.send(Message::async_maximum_message_size_response(agreed))
                    .await
            }
            MessageType::AsyncDeviceClear => {
                log::info!("Session {}: device clear requested", session.id());
                self.raise_clear_pending(session.id());
                self.send(Message::without_payload(
                    MessageType::AsyncDeviceClearAcknowledge,
                    session.overlap_mode() as u8,
                    0,
                ))
                .await
            }
            kind @ (MessageType::AsyncRemoteLocalControl | MessageType::AsyncStatusQuery) => {
                let response_kind = if kind == MessageType::AsyncStatusQuery {
                    MessageType::AsyncStatusResponse
                } else {
                    MessageType::AsyncRemoteLocalResponse
                };
                match handler.handle_async(message.control_code, &message.payload) {
                    Ok(response) => {
                        self.send(Message::new(response_kind, 0, 0, response)).await
                    }
                    Err(err) => {
                        log::warn!("Session {}: handler failed: {}", session.id(), err);
                        self.send(Message::error(ErrorCode::Unidentified, err.message()))
                            .await
                    }
                }
            }
            kind => self.unsupported(kind, "asynchronous").await,
        }
    }

    /// Sends a handler response as `DataEnd`, split into `Data` messages when it
    /// exceeds what the client accepts in one message.
    async fn send_data(
        &mut self,
        message_id: u32,
        response: &[u8],
        max_message_size: u64,
    ) -> Result<(), ConnectionError> {
        let chunk_size = usize::try_from(max_message_size)
            .unwrap_or(usize::MAX)
            .max(1);
        let mut chunks = response.chunks(chunk_size).peekable();
        while let Some(chunk) = chunks.next() {
            let message = if chunks.peek().is_some() {
                Message::data(message_id, chunk)
            } else {
                Message::data_end(message_id, chunk)
            };
            self.send(message).await?;
        }
        Ok(())
    }

    async fn unsupported(
        &mut self,
        kind: MessageType,
        channel: &str,
    ) -> Result<(), ConnectionError> {
        log::warn!(
            "Connection {}: unsupported {:?} on {} channel",
            self.id,
            kind,
            channel
        );
        let text = format!("{:?} is not supported on the {} channel", kind, channel);
        self.send(Message::error(ErrorCode::UnrecognizedMessageType, &text))
            .await
    }

    async fn payload_too_large(&mut self, max: u64, got: u64) -> Result<(), ConnectionError> {
        let text = format!("Payload of {} bytes exceeds maximum of {}", got, max);
        log::error!("Connection {}: {}", self.id, text);
        if let Err(err) = self
            .send(Message::error(ErrorCode::MessageTooLarge, &text))
            .await
        {
            log::debug!("Connection {}: could not report error: {}", self.id, err);
        }
        self.close(ConnectionState::FatalError);
        Ok(())
    }

    /// Reports a fatal error to the client and ends the connection.
    /// Failing to deliver the report is tolerated.
    async fn fatal(&mut self, code: FatalErrorCode, text: &str) -> Result<(), ConnectionError> {
        log::error!("Connection {}: fatal error {:?}: {}", self.id, code, text);
        if let Err(err) = self.send(Message::fatal_error(code, text)).await {
            log::debug!("Connection {}: could not report fatal error: {}", self.id, err);
        }
        self.close(ConnectionState::FatalError);
        Ok(())
    }

    /// The bound session, if it still exists and this connection is one of its channels
    fn current_session(&self) -> Option<(Session, Arc<dyn Subaddress>)> {
        let bound = self.bound.as_ref()?;
        let session = self
            .shared
            .sessions
            .get_owned(bound.session, self.id)
            .ok()?;
        Some((session, bound.handler.clone()))
    }

    fn raise_clear_pending(&self, session: SessionId) {
        if let Err(err) = self.shared.sessions.set_clear_pending(session, true) {
            log::debug!("Connection {}: {}", self.id, err);
        }
    }

    fn close(&mut self, state: ConnectionState) {
        if let Some(bound) = self.bound.take()
            && self.shared.sessions.release_channel(bound.session, self.id)
        {
            log::info!(
                "Connection {}: released session {}",
                self.id,
                bound.session
            );
        }
        self.state = state;
    }

    async fn send(&mut self, message: Message) -> Result<(), ConnectionError> {
        log::debug!(
            "Connection {}: sending {:?} (control code {}, parameter {:#x}, {} bytes)",
            self.id,
            message.kind,
            message.control_code,
            message.parameter,
            message.payload.len()
        );
        log::trace!("Payload: {:02x?}", &message.payload[..]);
        let write_timeout = self.config().write_timeout;
        match timeout(write_timeout, self.framed.send(message)).await {
            Ok(result) => result.map_err(ConnectionError::Write),
            Err(_) => Err(ConnectionError::WriteTimeout(write_timeout)),
        }
    }
}

impl<S> Drop for Connection<S> {
    /// Releases the session of a connection that never reached [`Connection::close`],
    /// e.g. when its task panicked or was aborted.
    fn drop(&mut self) {
        if let Some(bound) = self.bound.take()
            && self.shared.sessions.release_channel(bound.session, self.id)
        {
            log::warn!(
                "Connection {}: dropped, released session {}",
                self.id,
                bound.session
            );
        }
    }
}

#[cfg(test)]
mod test {
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use futures::{SinkExt, StreamExt};
    use hislip_protocol::{
        ErrorCode, FatalErrorCode, InitializeResponseParameter, Message, MessageType,
        ProtocolVersion, codec::MessageCodec,
    };
    use tokio::io::{AsyncWriteExt, DuplexStream, duplex};
    use tokio_util::codec::Framed;

    use super::{Connection, ConnectionState};
    use crate::server::{Builder, Server};
    use crate::session::SessionState;
    use crate::{HandlerError, Subaddress};

    /// Records every synchronous payload and echoes completed commands.
    #[derive(Default, Clone)]
    struct Recorder {
        calls: Arc<Mutex<Vec<(Vec<u8>, bool)>>>,
    }

    impl Recorder {
        fn calls(&self) -> Vec<(Vec<u8>, bool)> {
            self.calls.lock().unwrap().clone()
        }
    }

    impl Subaddress for Recorder {
        fn handle_sync(&self, payload: &[u8], end: bool) -> Result<Vec<u8>, HandlerError> {
            self.calls.lock().unwrap().push((payload.to_vec(), end));
            if payload == b"FAIL" {
                return Err(HandlerError::new("instrument busy"));
            }
            Ok(if end { payload.to_vec() } else { Vec::new() })
        }

        fn handle_async(&self, control_code: u8, _payload: &[u8]) -> Result<Vec<u8>, HandlerError> {
            Ok(vec![control_code])
        }
    }

    type Client = Framed<DuplexStream, MessageCodec>;

    fn server(builder: Builder, recorder: &Recorder) -> Server {
        let mut server = builder.build();
        server
            .register_subaddress("hislip0", recorder.clone())
            .unwrap();
        server
    }

    fn connect(server: &Server) -> (Client, Connection<DuplexStream>) {
        let (client, stream) = duplex(1 << 16);
        (
            Framed::new(client, MessageCodec::new(1 << 20)),
            server.connection(stream),
        )
    }

    async fn receive(client: &mut Client) -> Message {
        client.next().await.unwrap().unwrap().unwrap()
    }

    fn initialize(subaddress: &str) -> Message {
        Message::initialize(ProtocolVersion::from_u16(0x0100), 0x1234, subaddress)
    }

    /// Performs the synchronous handshake and returns the session id.
    async fn open(client: &mut Client, connection: &mut Connection<DuplexStream>) -> u16 {
        connection
            .handle_message(initialize("hislip0"))
            .await
            .unwrap();
        let response = receive(client).await;
        assert_eq!(response.kind, MessageType::InitializeResponse);
        InitializeResponseParameter::from(response.parameter).session_id
    }

    #[tokio::test]
    async fn initialize_opens_session() {
        let recorder = Recorder::default();
        let server = server(Builder::new(), &recorder);
        let (mut client, mut connection) = connect(&server);

        connection
            .handle_message(initialize("hislip0"))
            .await
            .unwrap();
        assert_eq!(connection.state(), ConnectionState::SessionActive);

        let response = receive(&mut client).await;
        assert_eq!(response.kind, MessageType::InitializeResponse);
        assert_eq!(response.control_code, 0);
        let parameter = InitializeResponseParameter::from(response.parameter);
        assert_eq!(parameter.version, ProtocolVersion::V1_0);
        assert_eq!(Some(parameter.session_id), connection.session_id());

        let session = server.sessions().get(parameter.session_id).unwrap();
        assert_eq!(session.subaddress(), "hislip0");
        assert_eq!(session.state(), SessionState::Active);
        assert_eq!(session.sync_channel(), connection.id());
        assert_eq!(server.sessions().allocated(), 1);
    }

    #[tokio::test]
    async fn empty_subaddress_selects_default() {
        let recorder = Recorder::default();
        let server = server(Builder::new(), &recorder);
        let (mut client, mut connection) = connect(&server);
        connection.handle_message(initialize("")).await.unwrap();
        assert_eq!(
            receive(&mut client).await.kind,
            MessageType::InitializeResponse
        );
    }

    #[tokio::test]
    async fn unsupported_version_allocates_nothing() {
        let recorder = Recorder::default();
        let server = server(Builder::new(), &recorder);
        let (mut client, mut connection) = connect(&server);

        connection
            .handle_message(Message::initialize(
                ProtocolVersion::new(2, 0),
                0x1234,
                "hislip0",
            ))
            .await
            .unwrap();
        assert_eq!(connection.state(), ConnectionState::FatalError);
        let response = receive(&mut client).await;
        assert_eq!(response.kind, MessageType::FatalError);
        assert_eq!(
            FatalErrorCode::from(response.control_code),
            FatalErrorCode::UnsupportedVersion
        );
        assert_eq!(server.sessions().allocated(), 0);
    }

    #[tokio::test]
    async fn unknown_subaddress_is_fatal() {
        let recorder = Recorder::default();
        let server = server(Builder::new(), &recorder);
        let (mut client, mut connection) = connect(&server);

        connection
            .handle_message(initialize("inst7"))
            .await
            .unwrap();
        assert_eq!(connection.state(), ConnectionState::FatalError);
        let response = receive(&mut client).await;
        assert_eq!(response.kind, MessageType::FatalError);
        assert_eq!(
            FatalErrorCode::from(response.control_code),
            FatalErrorCode::UnrecognizedSubaddress
        );

        // nothing is processed any more
        connection
            .handle_message(Message::data_end(1, b"*IDN?".to_vec()))
            .await
            .unwrap();
        assert_eq!(connection.state(), ConnectionState::FatalError);
        assert!(recorder.calls().is_empty());
        drop(connection);
        assert!(client.next().await.is_none());
    }

    #[tokio::test]
    async fn data_before_initialize_is_fatal() {
        let recorder = Recorder::default();
        let server = server(Builder::new(), &recorder);
        let (mut client, mut connection) = connect(&server);
        connection
            .handle_message(Message::data_end(1, b"*IDN?".to_vec()))
            .await
            .unwrap();
        let response = receive(&mut client).await;
        assert_eq!(
            FatalErrorCode::from(response.control_code),
            FatalErrorCode::InvalidInitializationSequence
        );
        assert_eq!(connection.state(), ConnectionState::FatalError);
    }

    #[tokio::test]
    async fn exhausted_session_table() {
        let recorder = Recorder::default();
        let server = server(Builder::new().max_sessions(1), &recorder);
        let (mut first_client, mut first) = connect(&server);
        open(&mut first_client, &mut first).await;

        let (mut client, mut connection) = connect(&server);
        connection
            .handle_message(initialize("hislip0"))
            .await
            .unwrap();
        assert_eq!(connection.state(), ConnectionState::FatalError);
        let response = receive(&mut client).await;
        assert_eq!(
            FatalErrorCode::from(response.control_code),
            FatalErrorCode::MaximumClientsExceeded
        );
        assert_eq!(server.sessions().allocated(), 1);
    }

    #[tokio::test]
    async fn data_is_routed_to_sync_handler() {
        let recorder = Recorder::default();
        let server = server(Builder::new(), &recorder);
        let (mut client, mut connection) = connect(&server);
        open(&mut client, &mut connection).await;

        connection
            .handle_message(Message::data(0xffff_ff00, b"*ID".to_vec()))
            .await
            .unwrap();
        connection
            .handle_message(Message::data_end(0xffff_ff00, b"N?".to_vec()))
            .await
            .unwrap();

        let response = receive(&mut client).await;
        assert_eq!(response.kind, MessageType::DataEnd);
        assert_eq!(response.parameter, 0xffff_ff00);
        assert_eq!(&response.payload[..], b"N?");
        assert_eq!(
            recorder.calls(),
            vec![(b"*ID".to_vec(), false), (b"N?".to_vec(), true)]
        );
    }

    #[tokio::test]
    async fn handler_failure_is_reported_as_error() {
        let recorder = Recorder::default();
        let server = server(Builder::new(), &recorder);
        let (mut client, mut connection) = connect(&server);
        open(&mut client, &mut connection).await;

        connection
            .handle_message(Message::data_end(2, b"FAIL".to_vec()))
            .await
            .unwrap();
        let response = receive(&mut client).await;
        assert_eq!(response.kind, MessageType::Error);
        assert_eq!(ErrorCode::from(response.control_code), ErrorCode::Unidentified);
        assert_eq!(response.payload_text(), "instrument busy");
        assert_eq!(connection.state(), ConnectionState::SessionActive);
    }

    #[tokio::test]
    async fn unknown_message_type_is_an_error() {
        let recorder = Recorder::default();
        let server = server(Builder::new(), &recorder);
        let (mut client, mut connection) = connect(&server);
        open(&mut client, &mut connection).await;

        connection
            .handle_message(Message::without_payload(MessageType::Unknown(99), 0, 0))
            .await
            .unwrap();
        let response = receive(&mut client).await;
        assert_eq!(
            ErrorCode::from(response.control_code),
            ErrorCode::UnrecognizedMessageType
        );
        assert_eq!(connection.state(), ConnectionState::SessionActive);
    }

    #[tokio::test]
    async fn async_channel_negotiates_message_size() {
        let recorder = Recorder::default();
        let server = server(Builder::new().vendor_id(0x4142), &recorder);
        let (mut sync_client, mut sync) = connect(&server);
        let session = open(&mut sync_client, &mut sync).await;

        let (mut async_client, mut asynchronous) = connect(&server);
        asynchronous
            .handle_message(Message::async_initialize(session))
            .await
            .unwrap();
        assert_eq!(asynchronous.state(), ConnectionState::AsyncAttached);
        let response = receive(&mut async_client).await;
        assert_eq!(response.kind, MessageType::AsyncInitializeResponse);
        assert_eq!(response.parameter, 0x4142);
        let bound = server.sessions().get(session).unwrap();
        assert_eq!(bound.state(), SessionState::AsyncAttached);
        assert_eq!(bound.async_channel(), Some(asynchronous.id()));

        asynchronous
            .handle_message(Message::async_maximum_message_size(u64::MAX))
            .await
            .unwrap();
        let response = receive(&mut async_client).await;
        assert_eq!(response.kind, MessageType::AsyncMaximumMessageSizeResponse);
        assert_eq!(
            response.size_payload(),
            Some(server.config().payload_size_max)
        );

        asynchronous
            .handle_message(Message::async_maximum_message_size(4))
            .await
            .unwrap();
        assert_eq!(receive(&mut async_client).await.size_payload(), Some(4));

        // responses on the synchronous channel now arrive in chunks of 4 bytes
        sync.handle_message(Message::data_end(7, b"0123456789".to_vec()))
            .await
            .unwrap();
        let chunks = [
            (MessageType::Data, &b"0123"[..]),
            (MessageType::Data, &b"4567"[..]),
            (MessageType::DataEnd, &b"89"[..]),
        ];
        for (kind, payload) in chunks {
            let message = receive(&mut sync_client).await;
            assert_eq!(message.kind, kind);
            assert_eq!(message.parameter, 7);
            assert_eq!(&message.payload[..], payload);
        }
    }

    #[tokio::test]
    async fn async_initialize_requires_open_session() {
        let recorder = Recorder::default();
        let server = server(Builder::new(), &recorder);
        let (mut sync_client, mut sync) = connect(&server);
        let session = open(&mut sync_client, &mut sync).await;

        let (mut client, mut unknown) = connect(&server);
        unknown
            .handle_message(Message::async_initialize(session + 1))
            .await
            .unwrap();
        assert_eq!(unknown.state(), ConnectionState::FatalError);
        assert_eq!(
            FatalErrorCode::from(receive(&mut client).await.control_code),
            FatalErrorCode::InvalidInitializationSequence
        );

        let (mut first_client, mut first) = connect(&server);
        first
            .handle_message(Message::async_initialize(session))
            .await
            .unwrap();
        receive(&mut first_client).await;
        let (mut second_client, mut second) = connect(&server);
        second
            .handle_message(Message::async_initialize(session))
            .await
            .unwrap();
        assert_eq!(second.state(), ConnectionState::FatalError);
        assert_eq!(
            receive(&mut second_client).await.kind,
            MessageType::FatalError
        );
        // the failed attempt does not tear down the session
        assert_eq!(
            server.sessions().get(session).unwrap().async_channel(),
            Some(first.id())
        );
    }

    #[tokio::test]
    async fn device_clear_discards_data_until_complete() {
        let recorder = Recorder::default();
        let server = server(Builder::new(), &recorder);
        let (mut sync_client, mut sync) = connect(&server);
        let session = open(&mut sync_client, &mut sync).await;
        let (mut async_client, mut asynchronous) = connect(&server);
        asynchronous
            .handle_message(Message::async_initialize(session))
            .await
            .unwrap();
        receive(&mut async_client).await;

        asynchronous
            .handle_message(Message::without_payload(
                MessageType::AsyncDeviceClear,
                0,
                0,
            ))
            .await
            .unwrap();
        assert_eq!(
            receive(&mut async_client).await.kind,
            MessageType::AsyncDeviceClearAcknowledge
        );
        assert!(server.sessions().get(session).unwrap().clear_pending());

        sync.handle_message(Message::data_end(1, b"*RST".to_vec()))
            .await
            .unwrap();
        sync.handle_message(Message::without_payload(
            MessageType::DeviceClearComplete,
            0,
            0,
        ))
        .await
        .unwrap();
        assert_eq!(
            receive(&mut sync_client).await.kind,
            MessageType::DeviceClearAcknowledge
        );
        sync.handle_message(Message::data_end(3, b"*CLS".to_vec()))
            .await
            .unwrap();
        assert_eq!(receive(&mut sync_client).await.parameter, 3);
        assert_eq!(recorder.calls(), vec![(b"*CLS".to_vec(), true)]);
    }

    #[tokio::test]
    async fn status_query_is_routed_to_async_handler() {
        let recorder = Recorder::default();
        let server = server(Builder::new(), &recorder);
        let (mut sync_client, mut sync) = connect(&server);
        let session = open(&mut sync_client, &mut sync).await;
        let (mut async_client, mut asynchronous) = connect(&server);
        asynchronous
            .handle_message(Message::async_initialize(session))
            .await
            .unwrap();
        receive(&mut async_client).await;

        asynchronous
            .handle_message(Message::without_payload(
                MessageType::AsyncStatusQuery,
                1,
                0,
            ))
            .await
            .unwrap();
        let response = receive(&mut async_client).await;
        assert_eq!(response.kind, MessageType::AsyncStatusResponse);
        assert_eq!(&response.payload[..], &[1]);
        assert!(recorder.calls().is_empty());
    }

    #[tokio::test]
    async fn closed_sync_channel_ends_async_channel() {
        let recorder = Recorder::default();
        let server = server(Builder::new(), &recorder);
        let (mut sync_client, mut sync) = connect(&server);
        let session = open(&mut sync_client, &mut sync).await;
        let (mut async_client, mut asynchronous) = connect(&server);
        asynchronous
            .handle_message(Message::async_initialize(session))
            .await
            .unwrap();
        receive(&mut async_client).await;

        sync.handle_message(Message::error(ErrorCode::Unidentified, "bye"))
            .await
            .unwrap();
        assert_eq!(sync.state(), ConnectionState::Closed);
        assert_eq!(server.sessions().allocated(), 0);

        asynchronous
            .handle_message(Message::async_maximum_message_size(64))
            .await
            .unwrap();
        assert_eq!(asynchronous.state(), ConnectionState::FatalError);
        assert_eq!(
            receive(&mut async_client).await.kind,
            MessageType::FatalError
        );
    }

    #[tokio::test]
    async fn peer_fatal_error_releases_session() {
        let recorder = Recorder::default();
        let server = server(Builder::new(), &recorder);
        let (mut client, mut connection) = connect(&server);
        open(&mut client, &mut connection).await;
        connection
            .handle_message(Message::fatal_error(FatalErrorCode::Unidentified, ""))
            .await
            .unwrap();
        assert_eq!(connection.state(), ConnectionState::FatalError);
        assert_eq!(server.sessions().allocated(), 0);
    }

    #[tokio::test]
    async fn malformed_header_drops_one_message() {
        let recorder = Recorder::default();
        let server = server(Builder::new(), &recorder);
        let (mut client, connection) = connect(&server);
        let task = tokio::spawn(connection.run());

        client.send(initialize("hislip0")).await.unwrap();
        assert_eq!(
            receive(&mut client).await.kind,
            MessageType::InitializeResponse
        );

        client
            .send(Message::data_end(1, b"A".to_vec()))
            .await
            .unwrap();
        let mut corrupt = Message::data_end(2, Vec::<u8>::new()).to_bytes();
        corrupt[..2].copy_from_slice(b"SH");
        client.get_mut().write_all(&corrupt).await.unwrap();
        client
            .send(Message::data_end(3, b"C".to_vec()))
            .await
            .unwrap();

        assert_eq!(receive(&mut client).await.parameter, 1);
        assert_eq!(receive(&mut client).await.parameter, 3);
        assert_eq!(
            recorder.calls(),
            vec![(b"A".to_vec(), true), (b"C".to_vec(), true)]
        );

        drop(client);
        assert_eq!(task.await.unwrap(), ConnectionState::Closed);
        assert_eq!(server.sessions().allocated(), 0);
    }

    #[tokio::test]
    async fn oversized_payload_ends_connection() {
        let recorder = Recorder::default();
        let server = server(Builder::new().payload_size_max(8), &recorder);
        let (mut client, connection) = connect(&server);
        let task = tokio::spawn(connection.run());

        client.send(initialize("hislip0")).await.unwrap();
        receive(&mut client).await;
        client
            .send(Message::data_end(1, vec![0u8; 9]))
            .await
            .unwrap();

        let response = receive(&mut client).await;
        assert_eq!(response.kind, MessageType::Error);
        assert_eq!(
            ErrorCode::from(response.control_code),
            ErrorCode::MessageTooLarge
        );
        assert_eq!(task.await.unwrap(), ConnectionState::FatalError);
        assert_eq!(server.sessions().allocated(), 0);
        assert!(recorder.calls().is_empty());
    }

    struct Panicking;

    impl Subaddress for Panicking {
        fn handle_sync(&self, _payload: &[u8], _end: bool) -> Result<Vec<u8>, HandlerError> {
            panic!("instrument driver crashed");
        }

        fn handle_async(&self, _control_code: u8, _payload: &[u8]) -> Result<Vec<u8>, HandlerError> {
            Ok(Vec::new())
        }
    }

    #[tokio::test]
    async fn panicking_handler_releases_session() {
        let mut server = Builder::new().max_sessions(1).build();
        server.register_subaddress("hislip0", Panicking).unwrap();
        let (mut client, connection) = connect(&server);
        let task = tokio::spawn(connection.run());

        client.send(initialize("hislip0")).await.unwrap();
        assert_eq!(
            receive(&mut client).await.kind,
            MessageType::InitializeResponse
        );
        assert_eq!(server.sessions().allocated(), 1);
        client
            .send(Message::data_end(1, b"*IDN?".to_vec()))
            .await
            .unwrap();

        assert!(task.await.unwrap_err().is_panic());
        assert_eq!(server.sessions().allocated(), 0);

        // the slot can be used by the next client
        let (mut next_client, mut next) = connect(&server);
        open(&mut next_client, &mut next).await;
        assert_eq!(server.sessions().allocated(), 1);
    }

    #[tokio::test]
    async fn aborted_connection_releases_session() {
        let recorder = Recorder::default();
        let server = server(Builder::new(), &recorder);
        let (mut client, connection) = connect(&server);
        let task = tokio::spawn(connection.run());
        client.send(initialize("hislip0")).await.unwrap();
        receive(&mut client).await;
        assert_eq!(server.sessions().allocated(), 1);

        task.abort();
        assert!(task.await.unwrap_err().is_cancelled());
        assert_eq!(server.sessions().allocated(), 0);
    }

    #[tokio::test]
    async fn write_timeout_closes_connection() {
        let recorder = Recorder::default();
        let server = server(
            Builder::new().write_timeout(Duration::from_millis(20)),
            &recorder,
        );
        let (client, stream) = duplex(256);
        let mut client = Framed::new(client, MessageCodec::new(1 << 20));
        let connection = server.connection(stream);
        let task = tokio::spawn(connection.run());

        // the echoed response does not fit into the pipe and nobody reads it
        client.send(initialize("hislip0")).await.unwrap();
        client
            .send(Message::data_end(1, vec![b'x'; 64 * 1024]))
            .await
            .unwrap();

        assert_eq!(task.await.unwrap(), ConnectionState::Closed);
        assert_eq!(server.sessions().allocated(), 0);
        assert_eq!(recorder.calls().len(), 1);
        drop(client);
    }

    #[tokio::test]
    async fn silent_connection_is_closed_after_liveness_timeout() {
        let recorder = Recorder::default();
        let server = server(
            Builder::new()
                .message_timeout(Duration::from_millis(10))
                .liveness_timeout(Duration::from_millis(30)),
            &recorder,
        );
        let (_client, connection) = connect(&server);
        assert_eq!(connection.run().await, ConnectionState::Closed);
    }

    #[tokio::test]
    async fn read_timeout_after_handshake_is_not_fatal() {
        let recorder = Recorder::default();
        let server = server(
            Builder::new()
                .message_timeout(Duration::from_millis(5))
                .liveness_timeout(Duration::from_secs(1)),
            &recorder,
        );
        let (mut client, connection) = connect(&server);
        let task = tokio::spawn(connection.run());
        client.send(initialize("hislip0")).await.unwrap();
        receive(&mut client).await;

        tokio::time::sleep(Duration::from_millis(50)).await;
        client
            .send(Message::data_end(4, b"*OPC?".to_vec()))
            .await
            .unwrap();
        assert_eq!(receive(&mut client).await.parameter, 4);
        assert!(!task.is_finished());
    }
}
