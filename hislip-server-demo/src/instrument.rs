//! # Simulated Instrument
//!
//! A minimal instrument answering the IEEE 488.2 common queries, enough to
//! exercise a HiSLIP client end to end.
//!
//! Each `DataEnd` payload is evaluated as one or more commands separated by `;`
//! or newlines. Payloads of `Data` messages are only logged, commands spanning
//! several messages are not supported.
use std::sync::atomic::{AtomicU8, Ordering};

use hislip_server::{HandlerError, Subaddress};

/// Status byte bit set while the standard event status register is not empty
const STATUS_EVENT_SUMMARY: u8 = 0x20;

/// Command error bit of the standard event status register
const EVENT_COMMAND_ERROR: u8 = 0x20;

pub struct Instrument {
    identity: String,
    event_status: AtomicU8,
}

impl Instrument {
    pub fn new(subaddress: &str) -> Instrument {
        Instrument {
            identity: format!(
                "hislip-rs,Simulated Instrument,{},{}",
                subaddress,
                env!("CARGO_PKG_VERSION")
            ),
            event_status: AtomicU8::new(0),
        }
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    fn execute(&self, command: &str) -> Result<Option<String>, HandlerError> {
        let command = command.trim();
        let header = command
            .split_whitespace()
            .next()
            .unwrap_or_default()
            .to_ascii_uppercase();
        match header.as_str() {
            "" => Ok(None),
            "*IDN?" => Ok(Some(self.identity.clone())),
            "*OPC?" => Ok(Some("1".to_string())),
            "*ESR?" => {
                let status = self.event_status.swap(0, Ordering::Relaxed);
                Ok(Some(status.to_string()))
            }
            "*RST" | "*CLS" => {
                self.event_status.store(0, Ordering::Relaxed);
                Ok(None)
            }
            "*OPC" | "*WAI" => Ok(None),
            _ => {
                self.event_status
                    .fetch_or(EVENT_COMMAND_ERROR, Ordering::Relaxed);
                Err(HandlerError::new(format!("Undefined header: {}", command)))
            }
        }
    }
}

impl Subaddress for Instrument {
    fn handle_sync(&self, payload: &[u8], end: bool) -> Result<Vec<u8>, HandlerError> {
        let text = String::from_utf8_lossy(payload);
        if !end {
            log::debug!("{}: ignoring partial command {:?}", self.identity, text);
            return Ok(Vec::new());
        }
        let mut answers = Vec::new();
        for command in text.split([';', '\n']) {
            if let Some(answer) = self.execute(command)? {
                answers.push(answer);
            }
        }
        if answers.is_empty() {
            Ok(Vec::new())
        } else {
            Ok(format!("{}\n", answers.join(";")).into_bytes())
        }
    }

    /// Answers status queries and remote/local requests with the status byte.
    fn handle_async(&self, _control_code: u8, _payload: &[u8]) -> Result<Vec<u8>, HandlerError> {
        let mut status = 0;
        if self.event_status.load(Ordering::Relaxed) != 0 {
            status |= STATUS_EVENT_SUMMARY;
        }
        Ok(vec![status])
    }
}
