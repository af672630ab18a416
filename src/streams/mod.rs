//! Pumping remote byte streams to local sinks and from local sources.
//!
//! Every stream gets its own worker thread. Workers block on their own I/O and
//! hand each remote call to the dispatch loop, so a slow stream never stalls
//! the loop or another stream.

pub mod listener;
pub mod worker;

use std::{
    fmt,
    io::Read,
    sync::{
        Arc, Mutex, PoisonError,
        atomic::{AtomicBool, Ordering},
    },
};

use serde::Serialize;
use thiserror::Error;

use crate::{channel::TransportError, dispatch::DispatchError};

pub use listener::{ProcessContext, ProcessStreamsListener};
pub use worker::{Callback, READ_SIZE, StreamWorker, WorkerState};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum StreamKind {
    Stdin,
    Stdout,
    Stderr,
}

impl fmt::Display for StreamKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            StreamKind::Stdin => "stdin",
            StreamKind::Stdout => "stdout",
            StreamKind::Stderr => "stderr",
        })
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StreamError {
    #[error("channel is not open")]
    Closed,

    #[error("agent has no streams service")]
    MissingService,

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Dispatch(#[from] DispatchError),

    #[error("could not start stream worker: {0}")]
    Spawn(String),
}

/// Where data read from a remote stream ends up.
pub trait DataReceiver: Send + Sync {
    fn is_applicable(&self, kind: StreamKind) -> bool;

    fn receive(&self, data: &[u8]);

    /// No more data will come.
    fn close(&self) {}
}

/// Local source of a remote stdin.
pub type DataProvider = Box<dyn Read + Send>;

/// Keeps everything it receives in memory.
pub struct BufferReceiver {
    kinds: Vec<StreamKind>,
    buffer: Mutex<Vec<u8>>,
    closed: AtomicBool,
}

impl BufferReceiver {
    pub fn new(kinds: &[StreamKind]) -> Arc<Self> {
        Arc::new(Self { kinds: kinds.to_vec(), buffer: Mutex::default(), closed: AtomicBool::new(false) })
    }

    pub fn contents(&self) -> Vec<u8> {
        self.buffer.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.contents()).into_owned()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl DataReceiver for BufferReceiver {
    fn is_applicable(&self, kind: StreamKind) -> bool {
        self.kinds.contains(&kind)
    }

    fn receive(&self, data: &[u8]) {
        self.buffer.lock().unwrap_or_else(PoisonError::into_inner).extend_from_slice(data);
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}
