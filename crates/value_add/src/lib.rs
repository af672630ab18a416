//! Shared protocol between the peerchain host and its value-add helper processes.
pub mod message;
pub mod relay;
pub mod runtime;
