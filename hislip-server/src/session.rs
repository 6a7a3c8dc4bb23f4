//! Bounded table of the sessions that are currently open on a server.
//!
//! Sessions are stored in a fixed number of slots; the slot index is the
//! session id announced to the client. A single mutex guards the table and is
//! only held for the duration of one operation.
use std::{
    error::Error,
    fmt::Display,
    sync::{Mutex, MutexGuard},
};

use hislip_protocol::ProtocolVersion;

/// Identifies a session. This is the session id sent in `InitializeResponse`.
pub type SessionId = u16;

/// Opaque handle of one physical connection, unique for the lifetime of a server.
pub type ConnectionId = u64;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum SessionState {
    /// Only the synchronous channel is established
    Active,
    /// Both channels are established
    AsyncAttached,
}

/// Everything fixed at `Initialize` time.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Binding {
    pub subaddress: String,
    pub protocol_version: ProtocolVersion,
    pub overlap_mode: bool,
    pub sync_channel: ConnectionId,
    /// Initial maximum message size, until the client negotiates one
    pub max_message_size: u64,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Session {
    id: SessionId,
    subaddress: String,
    state: SessionState,
    overlap_mode: bool,
    protocol_version: ProtocolVersion,
    sync_channel: ConnectionId,
    async_channel: Option<ConnectionId>,
    max_message_size: u64,
    clear_pending: bool,
}

impl Session {
    pub fn id(&self) -> SessionId {
        self.id
    }

    /// Name of the sub-address this session is bound to
    pub fn subaddress(&self) -> &str {
        &self.subaddress
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn overlap_mode(&self) -> bool {
        self.overlap_mode
    }

    pub fn protocol_version(&self) -> ProtocolVersion {
        self.protocol_version
    }

    pub fn sync_channel(&self) -> ConnectionId {
        self.sync_channel
    }

    pub fn async_channel(&self) -> Option<ConnectionId> {
        self.async_channel
    }

    /// The largest message the client accepts, as negotiated on the async channel
    pub fn max_message_size(&self) -> u64 {
        self.max_message_size
    }

    /// Whether a device clear was requested on the async channel and not yet
    /// completed on the sync channel
    pub fn clear_pending(&self) -> bool {
        self.clear_pending
    }

    fn owned_by(&self, connection: ConnectionId) -> bool {
        self.sync_channel == connection || self.async_channel == Some(connection)
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum SessionError {
    /// All slots are in use
    Exhausted,
    /// The id is out of range or the slot is free
    InvalidHandle(SessionId),
    /// The session already has an async channel
    AsyncAlreadyAttached(SessionId),
}

impl Display for SessionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionError::Exhausted => write!(f, "Too many active sessions"),
            SessionError::InvalidHandle(id) => write!(f, "Invalid session handle {}", id),
            SessionError::AsyncAlreadyAttached(id) => {
                write!(f, "Session {} already has an asynchronous channel", id)
            }
        }
    }
}

impl Error for SessionError {}

/// The session pool shared by all connections of a server.
#[derive(Debug)]
pub struct SessionTable {
    slots: Mutex<Vec<Option<Session>>>,
}

impl SessionTable {
    /// Creates a table with room for `capacity` concurrent sessions.
    /// Capacities beyond the 16 bit session id range are clamped.
    pub fn new(capacity: usize) -> SessionTable {
        let capacity = capacity.min(SessionId::MAX as usize + 1);
        SessionTable {
            slots: Mutex::new(vec![None; capacity]),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Vec<Option<Session>>> {
        // The slots are consistent after every single assignment, so a panic
        // while holding the lock cannot leave a half written session behind.
        self.slots.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn capacity(&self) -> usize {
        self.lock().len()
    }

    /// Number of currently allocated sessions
    pub fn allocated(&self) -> usize {
        self.lock().iter().filter(|slot| slot.is_some()).count()
    }

    /// Claims the first free slot and binds it.
    pub fn allocate(&self, binding: Binding) -> Result<SessionId, SessionError> {
        let mut slots = self.lock();
        let index = slots
            .iter()
            .position(Option::is_none)
            .ok_or(SessionError::Exhausted)?;
        let id = index as SessionId;
        slots[index] = Some(Session {
            id,
            subaddress: binding.subaddress,
            state: SessionState::Active,
            overlap_mode: binding.overlap_mode,
            protocol_version: binding.protocol_version,
            sync_channel: binding.sync_channel,
            async_channel: None,
            max_message_size: binding.max_message_size,
            clear_pending: false,
        });
        Ok(id)
    }

    /// Returns the slot to the pool. Releasing a free slot is an error.
    pub fn release(&self, id: SessionId) -> Result<(), SessionError> {
        let mut slots = self.lock();
        match slots.get_mut(id as usize) {
            Some(slot) if slot.is_some() => {
                *slot = None;
                Ok(())
            }
            _ => Err(SessionError::InvalidHandle(id)),
        }
    }

    /// Releases the session only if `connection` is still one of its channels.
    /// Returns whether the session was released.
    ///
    /// Both channels of a session tear it down when they close; whichever comes
    /// second finds the slot free (or reused by another session) and leaves it alone.
    pub fn release_channel(&self, id: SessionId, connection: ConnectionId) -> bool {
        let mut slots = self.lock();
        match slots.get_mut(id as usize) {
            Some(slot) if slot.as_ref().is_some_and(|s| s.owned_by(connection)) => {
                *slot = None;
                true
            }
            _ => false,
        }
    }

    /// A snapshot of the session
    pub fn get(&self, id: SessionId) -> Result<Session, SessionError> {
        self.lock()
            .get(id as usize)
            .and_then(Option::clone)
            .ok_or(SessionError::InvalidHandle(id))
    }

    /// Like [`SessionTable::get`], but fails unless `connection` is one of the session's channels.
    pub fn get_owned(
        &self,
        id: SessionId,
        connection: ConnectionId,
    ) -> Result<Session, SessionError> {
        self.get(id)
            .ok()
            .filter(|session| session.owned_by(connection))
            .ok_or(SessionError::InvalidHandle(id))
    }

    /// Binds `connection` as the asynchronous channel of a session.
    pub fn attach_async(
        &self,
        id: SessionId,
        connection: ConnectionId,
    ) -> Result<Session, SessionError> {
        self.modify(id, |session| {
            if session.async_channel.is_some() {
                return Err(SessionError::AsyncAlreadyAttached(id));
            }
            session.async_channel = Some(connection);
            session.state = SessionState::AsyncAttached;
            Ok(session.clone())
        })
    }

    pub fn set_max_message_size(&self, id: SessionId, size: u64) -> Result<(), SessionError> {
        self.modify(id, |session| {
            session.max_message_size = size;
            Ok(())
        })
    }

    pub fn set_clear_pending(&self, id: SessionId, pending: bool) -> Result<(), SessionError> {
        self.modify(id, |session| {
            session.clear_pending = pending;
            Ok(())
        })
    }

    /// Clears the device-clear flag and returns its previous value.
    pub fn take_clear_pending(&self, id: SessionId) -> Result<bool, SessionError> {
        self.modify(id, |session| Ok(std::mem::take(&mut session.clear_pending)))
    }

    fn modify<T>(
        &self,
        id: SessionId,
        f: impl FnOnce(&mut Session) -> Result<T, SessionError>,
    ) -> Result<T, SessionError> {
        let mut slots = self.lock();
        match slots.get_mut(id as usize) {
            Some(Some(session)) => f(session),
            _ => Err(SessionError::InvalidHandle(id)),
        }
    }
}
