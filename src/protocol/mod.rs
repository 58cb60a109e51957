//! Line-based CLI protocol: framing, token codec, request/reply session and
//! pushed-event parsing.

pub mod channel;
pub mod codec;
pub mod events;
pub mod session;

pub use channel::{ChannelCloser, LineChannel};
pub use codec::{Command, Record};
pub use events::ServerEvent;
pub use session::{ProtocolSession, Reply, Requester, SessionOptions, DEFAULT_CLI_PORT};
