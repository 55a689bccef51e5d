//! Durable execution
//!
//! [`DurableBackend`] is the seam to the service that runs pipelines
//! durably; [`LocalBackend`] is the in-process implementation. The
//! [`PipelineSupervisor`] applies each step's [`StepPolicy`] and records step
//! rows, and the [`CircuitBreaker`] decides when the engine should stop
//! trying the backend and use the fallback executor instead.

pub mod backend;
pub mod breaker;
pub mod local;
pub mod policy;
pub mod supervisor;

pub use backend::{DurableBackend, RunHandle, RunOutcome, RunRequest};
pub use breaker::{BreakerState, CircuitBreaker};
pub use local::LocalBackend;
pub use policy::{PipelinePolicy, StepPolicy};
pub use supervisor::PipelineSupervisor;
