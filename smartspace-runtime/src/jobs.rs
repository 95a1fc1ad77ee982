//! Maintenance background task.
//!
//! Periodically:
//!
//! - expires dispatched tool calls that outlived their bound and applies the
//!   owning agent's failure policy,
//! - deregisters connections that stopped pinging and re-dispatches their
//!   unresolved calls,
//! - evicts idle scope channels from the fanout broker.
//!
//! # Example
//!
//! ```ignore
//! let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
//! let handle = runtime.spawn_maintenance(shutdown_rx);
//!
//! // Later
//! let _ = shutdown_tx.send(true);
//! let metrics = handle.await?;
//! ```

use crate::runtime::{Core, Runtime};
use chrono::Utc;
use smartspace_core::{
    DispatchError, EventPayload, RunStatus, ScopeId, SpaceResult, Timestamp, ToolCall,
    ToolCallStatus, ToolFailurePolicy,
};
use smartspace_storage::Transition;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};

// ============================================================================
// METRICS
// ============================================================================

/// Counters for maintenance activity since startup.
#[derive(Debug, Default)]
pub struct MaintenanceMetrics {
    pub cycles: AtomicU64,
    pub calls_expired: AtomicU64,
    pub connections_reaped: AtomicU64,
    pub calls_redispatched: AtomicU64,
    pub channels_evicted: AtomicU64,
    pub errors: AtomicU64,
}

impl MaintenanceMetrics {
    pub fn snapshot(&self) -> MaintenanceSnapshot {
        MaintenanceSnapshot {
            cycles: self.cycles.load(Ordering::Relaxed),
            calls_expired: self.calls_expired.load(Ordering::Relaxed),
            connections_reaped: self.connections_reaped.load(Ordering::Relaxed),
            calls_redispatched: self.calls_redispatched.load(Ordering::Relaxed),
            channels_evicted: self.channels_evicted.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot of maintenance metrics at a point in time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MaintenanceSnapshot {
    pub cycles: u64,
    pub calls_expired: u64,
    pub connections_reaped: u64,
    pub calls_redispatched: u64,
    pub channels_evicted: u64,
    pub errors: u64,
}

/// What one sweep did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub expired: usize,
    pub reaped: usize,
    pub redispatched: usize,
    pub evicted: usize,
}

// ============================================================================
// SWEEPS
// ============================================================================

impl Runtime {
    /// Run one maintenance cycle now.
    pub async fn sweep(&self) -> SweepReport {
        self.core.sweep(Utc::now()).await
    }

    /// Expire overdue dispatched calls as of `now`. Returns how many expired.
    pub async fn expire_overdue(&self, now: Timestamp) -> SpaceResult<usize> {
        self.core.expire_overdue(now).await
    }

    pub fn maintenance_metrics(&self) -> MaintenanceSnapshot {
        self.core.metrics.snapshot()
    }

    /// Spawn the maintenance loop. It runs every `sweep_interval` until
    /// `shutdown` turns true and returns its metrics.
    pub fn spawn_maintenance(
        &self,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<Arc<MaintenanceMetrics>> {
        let core = Arc::clone(&self.core);
        tokio::spawn(async move {
            let mut ticker = interval(core.config.sweep_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            tracing::info!(
                sweep_interval_ms = core.config.sweep_interval.as_millis() as u64,
                tool_call_expiry_secs = core.config.tool_call_expiry.as_secs(),
                connection_stale_secs = core.config.connection_stale_timeout.as_secs(),
                "Maintenance task started"
            );

            loop {
                tokio::select! {
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            tracing::info!("Maintenance task shutting down");
                            break;
                        }
                    }
                    _ = ticker.tick() => {
                        core.sweep(Utc::now()).await;
                    }
                }
            }

            let snapshot = core.metrics.snapshot();
            tracing::info!(
                cycles = snapshot.cycles,
                calls_expired = snapshot.calls_expired,
                connections_reaped = snapshot.connections_reaped,
                calls_redispatched = snapshot.calls_redispatched,
                channels_evicted = snapshot.channels_evicted,
                errors = snapshot.errors,
                "Maintenance task completed"
            );
            Arc::clone(&core.metrics)
        })
    }
}

impl Core {
    pub(crate) async fn sweep(self: &Arc<Self>, now: Timestamp) -> SweepReport {
        let metrics = &self.metrics;
        metrics.cycles.fetch_add(1, Ordering::Relaxed);
        let mut report = SweepReport::default();

        match self.expire_overdue(now).await {
            Ok(expired) => report.expired = expired,
            Err(e) => {
                tracing::error!(error = %e, "Tool call expiry sweep failed");
                metrics.errors.fetch_add(1, Ordering::Relaxed);
            }
        }

        for connection_id in self.connections.stale(now, self.config.connection_stale_timeout) {
            let Some(connection) = self.connections.deregister(connection_id) else {
                continue;
            };
            report.reaped += 1;
            tracing::warn!(
                connection_id = %connection_id,
                connection_key = %connection.connection_key,
                "Stale connection deregistered"
            );
            match self.redispatch_from(&connection).await {
                Ok(moved) => report.redispatched += moved,
                Err(e) => {
                    tracing::error!(error = %e, connection_id = %connection_id, "Re-dispatch failed");
                    metrics.errors.fetch_add(1, Ordering::Relaxed);
                }
            }
        }

        report.evicted = self.log.broker().evict_idle(self.config.broker_idle_ttl);

        metrics
            .calls_expired
            .fetch_add(report.expired as u64, Ordering::Relaxed);
        metrics
            .connections_reaped
            .fetch_add(report.reaped as u64, Ordering::Relaxed);
        metrics
            .calls_redispatched
            .fetch_add(report.redispatched as u64, Ordering::Relaxed);
        metrics
            .channels_evicted
            .fetch_add(report.evicted as u64, Ordering::Relaxed);

        if report != SweepReport::default() {
            tracing::info!(
                expired = report.expired,
                reaped = report.reaped,
                redispatched = report.redispatched,
                evicted = report.evicted,
                "Maintenance cycle completed"
            );
        } else {
            tracing::trace!("Maintenance cycle completed with nothing to do");
        }
        report
    }

    /// Move every overdue dispatched call to `expired` and apply the owning
    /// agent's failure policy.
    ///
    /// A call that fails mid-way is logged and counted in
    /// `MaintenanceMetrics::errors`; the rest of the sweep carries on.
    pub(crate) async fn expire_overdue(self: &Arc<Self>, now: Timestamp) -> SpaceResult<usize> {
        let overdue: Vec<_> = self
            .storage
            .tool_call_list_dispatched()
            .await?
            .into_iter()
            .filter(|call| call.is_overdue(now))
            .collect();

        let mut expired = 0;
        for call in overdue {
            match self.expire_call(&call).await {
                Ok(true) => expired += 1,
                Ok(false) => {}
                Err(e) => {
                    tracing::error!(
                        run_id = %call.run_id,
                        call_id = %call.call_id,
                        error = %e,
                        "Tool call expiry failed"
                    );
                    self.metrics.errors.fetch_add(1, Ordering::Relaxed);
                }
            }
        }
        Ok(expired)
    }

    /// Expire one call. Returns false when it was resolved first.
    async fn expire_call(self: &Arc<Self>, call: &ToolCall) -> SpaceResult<bool> {
        let reason = DispatchError::Expired {
            call_id: call.call_id.clone(),
        }
        .to_string();
        let transition = self
            .storage
            .tool_call_resolve(
                call.run_id,
                &call.call_id,
                &[ToolCallStatus::Dispatched],
                ToolCallStatus::Expired,
                Some(reason.clone()),
            )
            .await?;
        if let Transition::Rejected(current) = transition {
            tracing::debug!(
                run_id = %call.run_id,
                call_id = %call.call_id,
                status = ?current.status,
                "Call resolved before expiry, skipping"
            );
            return Ok(false);
        }
        tracing::warn!(
            run_id = %call.run_id,
            call_id = %call.call_id,
            tool_name = %call.tool_name,
            "Tool call expired"
        );
        self.log
            .append(
                ScopeId::Run(call.run_id),
                EventPayload::ToolCallExpired {
                    run_id: call.run_id,
                    call_id: call.call_id.clone(),
                },
            )
            .await?;

        let run = self.load_run(call.run_id).await?;
        let policy = self
            .storage
            .identity_get(run.agent_id)
            .await?
            .and_then(|identity| identity.agent)
            .map(|profile| profile.tool_failure_policy)
            .unwrap_or_default();
        if policy == ToolFailurePolicy::FailRun {
            self.fail_run(
                call.run_id,
                &[RunStatus::Running, RunStatus::WaitingTool],
                reason,
            )
            .await?;
        } else {
            self.maybe_resume(call.run_id).await?;
        }
        Ok(true)
    }
}
