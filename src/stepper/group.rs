use std::{fmt, sync::Arc};

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::dispatch::Dispatcher;

use super::{
    data::{FullQualifiedId, StepData},
    step::{Step, StepError},
};

/// A step plus everything it runs with.
pub struct StepEntry<C> {
    pub step: Arc<dyn Step<C>>,
    pub context: Arc<C>,
    pub fqid: FullQualifiedId,
}

impl<C> Clone for StepEntry<C> {
    fn clone(&self) -> Self {
        Self { step: self.step.clone(), context: self.context.clone(), fqid: self.fqid.clone() }
    }
}

/// An ordered, immutable list of steps.
pub struct StepGroup<C> {
    name: String,
    entries: Vec<StepEntry<C>>,
}

impl<C> fmt::Debug for StepGroup<C>
where
    C: Send + Sync + 'static,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StepGroup")
            .field("name", &self.name)
            .field("steps", &self.describe())
            .finish()
    }
}

impl<C> StepGroup<C>
where
    C: Send + Sync + 'static,
{
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into(), entries: Vec::new() }
    }

    pub fn with_step(mut self, step: Arc<dyn Step<C>>, context: Arc<C>, fqid: FullQualifiedId) -> Self {
        self.entries.push(StepEntry { step, context, fqid });
        self
    }

    pub fn push(&mut self, step: Arc<dyn Step<C>>, context: Arc<C>, fqid: FullQualifiedId) {
        self.entries.push(StepEntry { step, context, fqid });
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[StepEntry<C>] {
        &self.entries
    }

    /// `fqid step-id` per entry, in execution order.
    pub fn describe(&self) -> Vec<String> {
        self.entries
            .iter()
            .map(|e| format!("{} {}", e.fqid, e.step.id()))
            .collect()
    }
}

/// Why a step group did not complete. `status` is the failure that stopped the
/// run; rollback problems never replace it.
#[derive(Error, Debug)]
#[error("step group `{group}` failed at `{failed_step}`: {status}")]
pub struct GroupFailure {
    pub group: String,
    pub failed_step: String,
    pub status: StepError,
    /// Ids of the steps that were rolled back, in rollback order.
    pub rolled_back: Vec<String>,
    pub rollback_errors: Vec<StepError>,
}

impl GroupFailure {
    pub fn is_rolled_back(&self) -> bool {
        !self.rolled_back.is_empty()
    }
}

enum Outcome {
    Done,
    Failed(StepError),
    /// Finished its work, but the group was cancelled while it ran.
    DoneThenCancelled,
}

/// Runs step groups on a dispatch loop.
#[derive(Clone, Debug)]
pub struct StepExecutor {
    dispatcher: Dispatcher,
}

impl StepExecutor {
    pub fn new(dispatcher: Dispatcher) -> Self {
        Self { dispatcher }
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    /// Run `group` to completion on the dispatch loop.
    ///
    /// Steps execute in order. When one fails validation or execution, or the
    /// data's cancellation token fires, every step that already executed is
    /// rolled back in reverse order before this returns.
    pub async fn run<C>(&self, group: StepGroup<C>, data: StepData) -> Result<(), GroupFailure>
    where
        C: Send + Sync + 'static,
    {
        let name = group.name.clone();
        match self.dispatcher.invoke(run_group(group, data)).await {
            Ok(result) => result,
            Err(e) => Err(GroupFailure {
                group: name,
                failed_step: String::new(),
                status: StepError::Dispatch(e),
                rolled_back: vec![],
                rollback_errors: vec![],
            }),
        }
    }
}

async fn run_group<C>(group: StepGroup<C>, data: StepData) -> Result<(), GroupFailure>
where
    C: Send + Sync + 'static,
{
    let cancel = data.cancellation().clone();
    let mut completed: Vec<&StepEntry<C>> = Vec::new();
    let mut failure: Option<(String, StepError)> = None;

    for entry in &group.entries {
        let step_id = entry.step.id().to_string();

        if cancel.is_cancelled() {
            failure = Some((step_id, StepError::Cancelled));
            break;
        }

        if let Err(e) = entry.step.validate(&entry.context, &data, &entry.fqid) {
            warn!(group = %group.name, step = %step_id, fqid = %entry.fqid, "validation failed: {e}");
            failure = Some((step_id, e));
            break;
        }

        debug!(group = %group.name, step = %step_id, fqid = %entry.fqid, "executing");
        match execute_entry(entry, &data).await {
            Outcome::Done => completed.push(entry),
            Outcome::DoneThenCancelled => {
                completed.push(entry);
                failure = Some((step_id, StepError::Cancelled));
                break;
            }
            Outcome::Failed(e) => {
                warn!(group = %group.name, step = %step_id, fqid = %entry.fqid, "execution failed: {e}");
                failure = Some((step_id, e));
                break;
            }
        }
    }

    let Some((failed_step, status)) = failure else {
        debug!(group = %group.name, "completed");
        return Ok(());
    };

    let mut rolled_back = Vec::with_capacity(completed.len());
    let mut rollback_errors = Vec::new();
    for entry in completed.into_iter().rev() {
        let step_id = entry.step.id().to_string();
        debug!(group = %group.name, step = %step_id, fqid = %entry.fqid, "rolling back");
        if let Err(e) = entry.step.rollback(&entry.context, &data, &status, &entry.fqid).await {
            warn!(group = %group.name, step = %step_id, "rollback failed: {e}");
            rollback_errors.push(e);
        }
        rolled_back.push(step_id);
    }

    info!(group = %group.name, step = %failed_step, rolled_back = rolled_back.len(), "step group failed: {status}");
    Err(GroupFailure { group: group.name.clone(), failed_step, status, rolled_back, rollback_errors })
}

async fn execute_entry<C>(entry: &StepEntry<C>, data: &StepData) -> Outcome
where
    C: Send + Sync + 'static,
{
    let cancel = data.cancellation().clone();
    let mut fut = entry.step.execute(&entry.context, data, &entry.fqid);

    tokio::select! {
        biased;
        res = &mut fut => match res {
            Ok(()) => Outcome::Done,
            Err(e) => Outcome::Failed(e),
        },
        _ = cancel.cancelled() => {
            let timeout = entry.step.cancel_timeout();
            match tokio::time::timeout(timeout, fut).await {
                Ok(Ok(())) => Outcome::DoneThenCancelled,
                Ok(Err(e)) => Outcome::Failed(e),
                Err(_) => Outcome::Failed(StepError::CancelTimeout {
                    step: entry.step.id().to_string(),
                    timeout_ms: timeout.as_millis(),
                }),
            }
        }
    }
}
