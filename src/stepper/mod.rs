//! Step orchestration: ordered steps, shared data, reverse rollback.

pub mod data;
pub mod group;
pub mod step;

pub use data::{DataValue, FullQualifiedId, StepData};
pub use group::{GroupFailure, StepEntry, StepExecutor, StepGroup};
pub use step::{DEFAULT_CANCEL_TIMEOUT, Step, StepError};
