//! SmartSpace Runtime - agent runs inside shared spaces.
//!
//! - [`Runtime`]: the facade for creating, canceling and observing runs,
//!   submitting tool results and posting space messages.
//! - Run state machine: `queued -> running <-> waiting_tool -> completed |
//!   failed`, with `canceled` from any non-terminal state.
//! - [`ToolRegistry`] / [`ToolDispatcher`]: schema-checked tool calls routed
//!   to local, remote-connection or external-service targets.
//! - [`ConnectionRegistry`]: live remote endpoints keyed by a stable client key.
//! - [`TriggerCoordinator`]: wakes agent members on new messages, bounded by
//!   trigger depth.
//! - Maintenance: call expiry, stale connection reaping, broker eviction.

mod connections;
mod context;
mod dispatcher;
mod executor;
mod external;
mod jobs;
mod lifecycle;
mod runtime;
pub mod telemetry;
mod tools;
mod trigger;

pub use connections::{ConnectionRegistry, PushError, Registration};
pub use context::{build_messages, CallOutcome, RunTranscript, TranscriptCall};
pub use dispatcher::{Dispatched, ToolDispatcher};
pub use executor::SubmitOutcome;
pub use external::ExternalToolClient;
pub use jobs::{MaintenanceMetrics, MaintenanceSnapshot, SweepReport};
pub use lifecycle::LifecycleEmitter;
pub use runtime::{ConnectionSession, PostOutcome, RecoveryReport, Runtime};
pub use telemetry::init_tracing;
pub use tools::{local_fn, FnTool, LocalTool, ToolInvocation, ToolRegistry, ToolSpec};
pub use trigger::{RunLauncher, RunRequest, Trigger, TriggerCoordinator};
