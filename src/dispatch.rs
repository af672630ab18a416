//! The dispatch loop.
//!
//! One dedicated OS thread runs a single-threaded tokio runtime. Everything
//! that touches channel, step group or path-map state is posted here, so that
//! state never needs more than one owner. Work that blocks (process I/O, stream
//! reads) runs on worker threads and posts its results back.

use std::{
    cell::Cell,
    future::Future,
    pin::Pin,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    thread,
};

use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, trace};

type Job = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    /// Id of the loop running on this thread, 0 elsewhere.
    static DISPATCH_ID: Cell<u64> = const { Cell::new(0) };
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DispatchError {
    #[error("dispatch loop `{0}` is not running")]
    Stopped(String),

    #[error("job dropped before it completed")]
    Dropped,

    #[error("blocking wait on the dispatch thread would deadlock")]
    WouldDeadlock,

    #[error("could not start dispatch thread: {0}")]
    Spawn(String),
}

/// Handle to a running dispatch loop. Cheap to clone; the loop exits once the
/// last handle is dropped.
#[derive(Clone)]
pub struct Dispatcher {
    id: u64,
    name: Arc<str>,
    tx: mpsc::UnboundedSender<Job>,
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher").field("name", &self.name).finish()
    }
}

impl Dispatcher {
    pub fn start(name: &str) -> Result<Self, DispatchError> {
        let (tx, mut rx) = mpsc::unbounded_channel::<Job>();
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|e| DispatchError::Spawn(e.to_string()))?;

        let id = NEXT_ID.fetch_add(1, Ordering::Relaxed);
        let thread_name = format!("dispatch-{name}");
        thread::Builder::new()
            .name(thread_name.clone())
            .spawn(move || {
                DISPATCH_ID.with(|current| current.set(id));
                debug!(thread = %thread_name, "dispatch loop started");
                runtime.block_on(async move {
                    while let Some(job) = rx.recv().await {
                        tokio::spawn(job);
                    }
                });
                debug!(thread = %thread_name, "dispatch loop stopped");
            })
            .map_err(|e| DispatchError::Spawn(e.to_string()))?;

        Ok(Self { id, name: Arc::from(name), tx })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// True when called from any dispatch loop thread.
    pub fn is_dispatch_thread() -> bool {
        DISPATCH_ID.with(|current| current.get() != 0)
    }

    /// True when called from this loop's own thread.
    pub fn is_current(&self) -> bool {
        DISPATCH_ID.with(|current| current.get() == self.id)
    }

    /// Post a job and return immediately.
    pub fn invoke_later<F>(&self, job: F) -> Result<(), DispatchError>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        trace!(dispatcher = %self.name, "posting job");
        self.tx
            .send(Box::pin(job))
            .map_err(|_| DispatchError::Stopped(self.name.to_string()))
    }

    /// Run `job` on the loop and await its result from anywhere. On the loop's
    /// own thread the job runs inline.
    pub async fn invoke<F, T>(&self, job: F) -> Result<T, DispatchError>
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        if self.is_current() {
            return Ok(job.await);
        }
        let (done_tx, done_rx) = oneshot::channel();
        self.invoke_later(async move {
            let _ = done_tx.send(job.await);
        })?;
        done_rx.await.map_err(|_| DispatchError::Dropped)
    }

    /// Blocking variant of [`Dispatcher::invoke`] for plain worker threads.
    ///
    /// Fails with [`DispatchError::WouldDeadlock`] on the dispatch thread and
    /// must not be called from inside an async runtime.
    pub fn invoke_and_wait<F, T>(&self, job: F) -> Result<T, DispatchError>
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        if Self::is_dispatch_thread() {
            error!(dispatcher = %self.name, "invoke_and_wait called on the dispatch thread");
            return Err(DispatchError::WouldDeadlock);
        }
        let (done_tx, done_rx) = oneshot::channel();
        self.invoke_later(async move {
            let _ = done_tx.send(job.await);
        })?;
        done_rx.blocking_recv().map_err(|_| DispatchError::Dropped)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[tokio::test]
    async fn invoke_runs_on_the_dispatch_thread() {
        let dispatcher = Dispatcher::start("test").unwrap();
        assert!(!Dispatcher::is_dispatch_thread());
        let d = dispatcher.clone();
        let on_loop = dispatcher.invoke(async move { d.is_current() }).await.unwrap();
        assert!(on_loop);
        assert!(!dispatcher.is_current());
    }

    #[tokio::test]
    async fn invoke_from_another_loop_hops_threads() {
        let first = Dispatcher::start("first").unwrap();
        let second = Dispatcher::start("second").unwrap();
        let (f, s, inner) = (first.clone(), second.clone(), second.clone());
        let (on_first, on_second) = first
            .invoke(async move { s.invoke(async move { (f.is_current(), inner.is_current()) }).await })
            .await
            .unwrap()
            .unwrap();
        assert!(!on_first);
        assert!(on_second);
    }

    #[tokio::test]
    async fn jobs_run_in_posting_order() {
        let dispatcher = Dispatcher::start("order").unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));
        for i in 0..10 {
            let seen = seen.clone();
            dispatcher
                .invoke_later(async move { seen.lock().unwrap().push(i) })
                .unwrap();
        }
        dispatcher.invoke(async {}).await.unwrap();
        assert_eq!(*seen.lock().unwrap(), (0..10).collect::<Vec<_>>());
    }

    #[test]
    fn invoke_and_wait_from_a_worker_thread() {
        let dispatcher = Dispatcher::start("blocking").unwrap();
        let d = dispatcher.clone();
        let value = thread::spawn(move || d.invoke_and_wait(async { 40 + 2 }))
            .join()
            .unwrap()
            .unwrap();
        assert_eq!(value, 42);
    }

    #[tokio::test]
    async fn invoke_and_wait_on_the_loop_is_refused() {
        let dispatcher = Dispatcher::start("deadlock").unwrap();
        let d = dispatcher.clone();
        let res = dispatcher.invoke(async move { d.invoke_and_wait(async {}) }).await.unwrap();
        assert_eq!(res, Err(DispatchError::WouldDeadlock));
    }
}
