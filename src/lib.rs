//! Open channels to remote agents through chains of proxy peers.
//!
//! A channel is opened by running a group of steps on a single dispatch
//! thread: helper processes are launched in front of the peers that need
//! them, the channel is redirected hop by hop, the path map is attached and
//! the channel's log name is announced. Once open, process streams are pumped
//! between the agent and local readers and writers.

pub mod channel;
pub mod config;
pub mod dispatch;
pub mod logger;
pub mod pathmap;
pub mod schema;
pub mod stepper;
pub mod streams;
pub mod value_add;
pub mod watcher;
