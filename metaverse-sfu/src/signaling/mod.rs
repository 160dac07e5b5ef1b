//! Signaling gateway: wire protocol and per-connection sessions

pub mod protocol;
mod session;

pub use protocol::{ClientRequest, ErrorBody, RequestFrame, ResponseFrame, ServerEvent, ServerMessage};
pub use session::SignalingSession;
