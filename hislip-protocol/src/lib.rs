//! # HiSLIP Protocol Library
//!
//! This crate provides a Rust implementation of the message format of
//! [HiSLIP](https://www.ivifoundation.org/specifications/) (High-Speed LAN Instrument Protocol),
//! the TCP based successor of VXI-11 used to remote control test and measurement instruments.
//!
//! ## Overview
//!
//! A HiSLIP client opens a *synchronous* channel to a server and, optionally, an
//! *asynchronous* channel belonging to the same session. Both channels carry the same
//! binary messages. This library allows you to:
//!
//! - Serialize and deserialize HiSLIP messages
//! - Pack and unpack the type specific header parameters (protocol version, vendor id, session id)
//! - Frame messages on async streams using the `tokio` feature
//!
//! ## Message Format
//!
//! Every message consists of a fixed 16 byte header followed by a payload.
//! All multi-byte fields are big endian (network byte order).
//!
//! | Field | Size | Meaning |
//! |---|---|---|
//! | prologue | 2 bytes | `"HS"` |
//! | type | 1 byte | [`MessageType`] |
//! | control code | 1 byte | type specific flag |
//! | parameter | 4 bytes | type specific value |
//! | payload length | 8 bytes | length of the following payload |
//!
//! ## Basic Usage
//!
//! ### Writing Messages
//!
//! ```
//! use hislip_protocol::{Message, ProtocolVersion};
//!
//! let msg = Message::initialize(ProtocolVersion::V1_0, 0x1234, "hislip0");
//! let mut buffer = Vec::new();
//! msg.write_to(&mut buffer).expect("Writing to vector shouldn't fail");
//! assert_eq!(&buffer[..8], b"HS\x00\x00\x01\x00\x12\x34");
//! assert_eq!(&buffer[16..], b"hislip0");
//! ```
//!
//! ### Reading Messages
//!
//! ```
//! use hislip_protocol::{InitializeResponseParameter, Message, MessageType, ProtocolVersion};
//! use std::io::Cursor;
//!
//! let data = b"HS\x01\x00\x01\x00\x00\x02\x00\x00\x00\x00\x00\x00\x00\x00";
//! let mut reader = Cursor::new(data);
//! let msg = Message::from_reader(&mut reader, 1024).expect("Message should parse");
//! assert_eq!(msg.kind, MessageType::InitializeResponse);
//! let parameter = InitializeResponseParameter::from(msg.parameter);
//! assert_eq!(parameter.version, ProtocolVersion::V1_0);
//! assert_eq!(parameter.session_id, 2);
//! ```
//!
//! ## Error Handling
//!
//! This library uses the [`error::ReadError`] type for parsing errors.
//! [`error::ReadError::is_format_error`] separates malformed headers, after which
//! a reader may continue, from errors that leave the stream unusable.
//!
//! ## Thread Safety
//!
//! The types in this library are thread-safe and can be safely shared across threads.
//! However, I/O operations (reading/writing) are not synchronized and require external coordination.

pub mod protocol;
pub use protocol::*;
pub mod codec;
pub mod error;
