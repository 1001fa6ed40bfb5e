//! crew Protocol - Agent output parsing and daemon wire protocol
//!
//! This crate provides:
//! - [`parse`]: the line codec that turns agent stdout into records
//! - [`message`]: JSON-lines messages exchanged between `crew` and `crewd`
//! - [`version`]: protocol version negotiation

pub mod message;
pub mod parse;
pub mod version;

pub use message::{ClientMessage, DaemonMessage, ErrorCode, MessageType};
pub use parse::{
    parse_line, sanitize_line, AgentLineCodec, AgentRecord, ParseSkipped, ParsedLine,
    MAX_LINE_LENGTH,
};
pub use version::{ProtocolVersion, VersionError};
