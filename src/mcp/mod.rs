//! MCP (Model Context Protocol) message model and codec
//!
//! Transport-neutral: the same types travel over streamable HTTP and over
//! pub/sub channels.

pub mod codec;
pub mod protocol;
pub mod types;

pub use protocol::{
    methods, ErrorObject, Message, Notification, Request, RequestId, Response, PROTOCOL_VERSION,
};
pub use types::*;
