//! `engine` crate: workflow models, graph ordering, and the execution engine.

pub mod error;
pub mod events;
pub mod graph;
pub mod models;
pub mod node;
pub mod orchestrator;
pub mod worker;

pub use error::EngineError;
pub use events::{EventPublisher, EventStatus, LifecycleEvent, WORKFLOW_EVENT_CHANNEL};
pub use graph::{validate_dag, Graph};
pub use models::{
    EdgeData, ExecutionJob, ExecutionMetadata, NodeData, TriggerData, TriggeredBy,
    WorkflowDefinition,
};
pub use node::{Node, NodeKind};
pub use orchestrator::{Orchestrator, RunOutcome};
pub use worker::{submit, ExecutionWorker, WorkerConfig, EXECUTION_TOPIC};
