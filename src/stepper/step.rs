use std::{error::Error as StdError, time::Duration};

use async_trait::async_trait;
use thiserror::Error;

use crate::dispatch::DispatchError;

use super::data::{FullQualifiedId, StepData};

/// How long the engine waits for a running step to settle after cancellation.
pub const DEFAULT_CANCEL_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Error, Debug)]
pub enum StepError {
    #[error("step `{step}` cannot run: {reason}")]
    Validation { step: String, reason: String },

    #[error("step group cancelled")]
    Cancelled,

    #[error("step `{step}` did not settle within {timeout_ms} ms of cancellation")]
    CancelTimeout { step: String, timeout_ms: u128 },

    #[error(transparent)]
    Dispatch(#[from] DispatchError),

    #[error("step `{step}` failed: {source}")]
    Failed {
        step: String,
        #[source]
        source: Box<dyn StdError + Send + Sync>,
    },
}

impl StepError {
    pub fn validation(step: &str, reason: impl Into<String>) -> Self {
        StepError::Validation { step: step.to_string(), reason: reason.into() }
    }

    pub fn failed<E>(step: &str, err: E) -> Self
    where
        E: StdError + Send + Sync + 'static,
    {
        StepError::Failed { step: step.to_string(), source: Box::new(err) }
    }

    /// The typed cause of a `Failed` error, if it is an `E`.
    pub fn cause<E: StdError + 'static>(&self) -> Option<&E> {
        match self {
            StepError::Failed { source, .. } => source.downcast_ref::<E>(),
            _ => None,
        }
    }

    pub fn is_cancellation(&self) -> bool {
        matches!(self, StepError::Cancelled | StepError::CancelTimeout { .. })
    }
}

/// One unit of a step group.
///
/// `execute` runs at most once per group run. `rollback` only runs when the
/// step executed successfully and a later step failed or the group was
/// cancelled; it receives the status that triggered it.
#[async_trait]
pub trait Step<C>: Send + Sync
where
    C: Send + Sync + 'static,
{
    fn id(&self) -> &str;

    /// Checks preconditions before any side effect.
    fn validate(&self, _ctx: &C, _data: &StepData, _fqid: &FullQualifiedId) -> Result<(), StepError> {
        Ok(())
    }

    async fn execute(&self, ctx: &C, data: &StepData, fqid: &FullQualifiedId) -> Result<(), StepError>;

    async fn rollback(
        &self,
        _ctx: &C,
        _data: &StepData,
        _status: &StepError,
        _fqid: &FullQualifiedId,
    ) -> Result<(), StepError> {
        Ok(())
    }

    fn cancel_timeout(&self) -> Duration {
        DEFAULT_CANCEL_TIMEOUT
    }
}
