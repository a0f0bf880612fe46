//! Agent orchestrator and action executor.
//!
//! The orchestrator turns pending recommendations into cards and may approve
//! low-risk ones on its own; the executor runs approved cards through their
//! handlers, sending email only via the outbound gate.

pub mod config;
pub mod executor;
pub mod handlers;
pub mod orchestrator;

pub use config::{ExecutorConfig, OrchestratorConfig};
pub use executor::{ActionExecutor, BatchExecution, ExecutionReport, ExecutionStatus};
pub use handlers::{
    ActionHandler, EmailHandler, ExecutionError, HandlerReceipt, HandlerRegistry,
    LocalRecordHandler,
};
pub use orchestrator::{AgentOrchestrator, OrchestratorError, WorkBlock};
