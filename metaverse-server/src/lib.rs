//! HTTP/WebSocket front end for the metaverse SFU
//!
//! Configuration, logging, the JWT gate on the signaling sockets and the
//! server lifecycle. Room orchestration lives in `metaverse-sfu`.

pub mod auth;
pub mod config;
pub mod http;
pub mod logging;
pub mod server;

pub use config::{load_config, Config};
pub use server::MetaverseServer;
