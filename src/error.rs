//! Error taxonomy shared by the session, the connection state machine and
//! the catalog lists.
//!
//! Transport and protocol failures during normal operation are returned to
//! the caller that issued the request. Only failures during
//! connect/login/handshake change the shared connection state.

use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CliError {
    /// The transport could not be opened (refused, unreachable, or the
    /// connect timeout elapsed).
    #[error("could not connect to {address}: {reason}")]
    ConnectFailed { address: String, reason: String },

    /// The server dropped the socket before answering the login step.
    #[error("server rejected the credentials")]
    AuthRejected,

    /// No reply arrived within the bound.
    #[error("no reply to '{command}' after {after:?}")]
    Timeout { command: String, after: Duration },

    /// The session is gone (disconnected, closed by the peer, or never opened).
    #[error("session closed")]
    SessionClosed,

    /// Index lookup outside `[0, total)`.
    #[error("index {index} out of range (total {total})")]
    OutOfRange { index: usize, total: usize },

    /// A reply line could not be decoded as expected.
    #[error("malformed reply to '{command}': {reason}")]
    MalformedReply { command: String, reason: String },

    /// The catalog has no list registered under this id.
    #[error("unknown list '{list_id}'")]
    UnknownList { list_id: String },
}

impl CliError {
    pub(crate) fn malformed(command: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::MalformedReply {
            command: command.into(),
            reason: reason.into(),
        }
    }

    /// Whether the error means the underlying session can no longer be used.
    pub fn is_fatal_to_session(&self) -> bool {
        matches!(
            self,
            Self::SessionClosed | Self::AuthRejected | Self::ConnectFailed { .. }
        )
    }
}

pub type CliResult<T> = Result<T, CliError>;
