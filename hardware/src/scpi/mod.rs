//! SCPI transport over TCP.
//!
//! The pressure reference speaks a newline-terminated ASCII protocol on a raw TCP
//! socket. Every command is written as a single line; queries (commands whose header
//! ends in `?`) are answered with exactly one line, writes are not answered at all.
//!
//! [`ScpiLink`] owns the socket inside a background task and serializes all traffic
//! through a FIFO request queue, so concurrent callers never interleave their reads on
//! the single response stream. Each query races a response deadline; when the deadline
//! wins the caller gets [`LinkError::Timeout`] and the queue is held for one more
//! response window, so a late reply is discarded rather than handed to the next caller.
//!
//! Unexpected disconnects trigger automatic reconnects with exponential backoff
//! (see [`reconnect_delay`]) until `max_reconnect_attempts` is exhausted.

mod command;
mod link;

use std::time::Duration;

use thiserror::Error;

pub use command::Command;
pub use link::{reconnect_delay, LinkConfig, LinkEvent, LinkState, ScpiLink};

/// Default raw-socket SCPI port.
pub const DEFAULT_PORT: u16 = 5025;

/// Default time to wait for the reply to a query.
pub const DEFAULT_RESPONSE_TIMEOUT: Duration = Duration::from_secs(5);

/// Errors raised by the SCPI link.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum LinkError {
    /// No reply arrived inside the response window. The instrument is considered busy;
    /// the connection itself is still up.
    #[error("instrument busy: no response to `{command}` within {timeout:?}")]
    Timeout { command: String, timeout: Duration },

    /// A command was issued while no connection is established.
    #[error("not connected to instrument")]
    NotConnected,

    /// Opening the TCP connection failed.
    #[error("connection to {addr} failed: {reason}")]
    Connection { addr: String, reason: String },

    /// The socket closed or errored while a command was in flight.
    #[error("connection lost during `{command}`: {reason}")]
    ConnectionLost { command: String, reason: String },

    /// Automatic reconnection gave up. Further commands fail until `connect` succeeds.
    #[error("gave up reconnecting to {addr} after {attempts} attempts")]
    ReconnectExhausted { addr: String, attempts: u32 },

    /// [`ScpiLink::query`] was given a command that gets no reply.
    #[error("`{command}` is not a query")]
    NotAQuery { command: String },

    /// The link task is gone (the link was dropped).
    #[error("SCPI link task has shut down")]
    Closed,
}

impl LinkError {
    /// True for transport-level failures, as opposed to a busy instrument.
    pub fn is_connection_error(&self) -> bool {
        !matches!(
            self,
            LinkError::Timeout { .. } | LinkError::NotAQuery { .. }
        )
    }
}

pub type LinkResult<T> = Result<T, LinkError>;
