//! `WebSocket` protocol: connection state, registry, upload sessions, frame
//! handling, keep-alive and the socket lifecycle.

pub mod connection;
pub mod engine;
pub mod handler;
pub mod heartbeat;
pub mod messages;
pub mod registry;
pub mod session;
