//! Run lifecycle events.
//!
//! Every transition is appended to the run's own scope, which is the durable
//! source of truth. The space-scope copy follows [`LifecycleMirror`]: a live
//! projection by default, or a second append that may be lost if the process
//! dies between the two writes.

use smartspace_core::{Event, EventPayload, LifecycleMirror, Run, SpaceResult};
use smartspace_events::EventLog;
use tracing::{debug, warn};

#[derive(Clone)]
pub struct LifecycleEmitter {
    log: EventLog,
    mirror: LifecycleMirror,
}

impl LifecycleEmitter {
    pub fn new(log: EventLog, mirror: LifecycleMirror) -> Self {
        Self { log, mirror }
    }

    /// The `run.queued` payload for a freshly created run.
    pub fn queued(run: &Run) -> EventPayload {
        EventPayload::RunQueued {
            run_id: run.run_id,
            agent_id: run.agent_id,
            triggered_by: run.triggered_by,
            trigger_depth: run.metadata.trigger_depth,
        }
    }

    /// Announce the status `run` currently holds.
    pub async fn transition(&self, run: &Run, pending_calls: Vec<String>) -> SpaceResult<Event> {
        let payload = match EventPayload::lifecycle(
            run.run_id,
            run.status,
            pending_calls,
            run.error.clone(),
        ) {
            Some(payload) => payload,
            None => Self::queued(run),
        };
        self.emit(run, payload).await
    }

    /// Append `payload` to the run scope and mirror it onto the space scope.
    pub async fn emit(&self, run: &Run, payload: EventPayload) -> SpaceResult<Event> {
        let event = self.log.append(run.scope(), payload).await?;
        debug!(
            run_id = %run.run_id,
            seq = event.seq,
            event_type = event.event_type(),
            "Lifecycle event"
        );

        match self.mirror {
            LifecycleMirror::Projection => self.log.project(run.space_scope(), &event),
            LifecycleMirror::Durable => {
                if let Err(e) = self
                    .log
                    .append(run.space_scope(), event.payload.clone())
                    .await
                {
                    warn!(
                        run_id = %run.run_id,
                        space_id = %run.space_id,
                        error = %e,
                        "Space copy of lifecycle event lost"
                    );
                }
            }
        }
        Ok(event)
    }

    pub fn mirror(&self) -> LifecycleMirror {
        self.mirror
    }
}
