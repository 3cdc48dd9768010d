//! Failure inbox: failed mutations and the operator actions on them.

use opentelemetry::KeyValue;
use std::sync::Arc;
use tracing::{info, warn};

use crate::engine::sync::record_failure;
use crate::engine::{FlushReport, SyncEngine};
use crate::error::{Error, Result};
use crate::model::*;
use crate::telemetry::metrics;

#[derive(Clone)]
pub struct FailureInbox {
    engine: Arc<SyncEngine>,
}

impl FailureInbox {
    pub fn new(engine: Arc<SyncEngine>) -> Self {
        Self { engine }
    }

    /// Queued mutations with a recorded error, in queue order. Includes both
    /// parked entries and ones automatic flushes are still retrying.
    pub async fn list(&self) -> Result<Vec<PendingMutation>> {
        Ok(self
            .engine
            .queue()
            .load()
            .await?
            .into_iter()
            .filter(PendingMutation::is_failed)
            .collect())
    }

    pub async fn count(&self) -> Result<usize> {
        Ok(self.engine.queue().counts().await?.failed)
    }

    /// Reapply one failed mutation now. Waits for an in-flight flush to
    /// finish first. Returns true if it was applied and removed.
    pub async fn retry_one(&self, id: MutationId) -> Result<bool> {
        let _flight = self.engine.flight().lock().await;

        let pending = self.engine.queue().get(id).await?;
        if !pending.is_failed() {
            return Err(Error::NotFound(format!("failed mutation {id}")));
        }

        let outcome = self.engine.attempt(&pending).await;
        let max_attempts = self.engine.config().max_attempts;
        let (report, counts) = self
            .engine
            .queue()
            .update(|entries| {
                let mut report = FlushReport {
                    attempted: 1,
                    ..FlushReport::default()
                };
                match &outcome {
                    Ok(()) => {
                        entries.retain(|e| e.id != id);
                        report.applied.push(id);
                    }
                    Err(err) => {
                        report.failed.push(id);
                        if let Some(entry) = entries.iter_mut().find(|e| e.id == id)
                            && record_failure(entry, err, max_attempts)
                        {
                            report.parked.push(id);
                        }
                    }
                }
                Ok(report)
            })
            .await?;

        let result = if outcome.is_ok() { "applied" } else { "failed" };
        metrics::inbox_actions().add(
            1,
            &[
                KeyValue::new("action", "retry"),
                KeyValue::new("result", result),
            ],
        );
        match &outcome {
            Ok(()) => info!(%id, "failed mutation retried successfully"),
            Err(e) => warn!(%id, error = %e, "retry failed"),
        }

        self.engine.settle(&report, counts, None);
        Ok(outcome.is_ok())
    }

    /// Drop a mutation without applying it. The change it carried is lost.
    pub async fn dismiss_one(&self, id: MutationId) -> Result<PendingMutation> {
        let (dismissed, counts) = self
            .engine
            .queue()
            .update(|entries| {
                let pos = entries
                    .iter()
                    .position(|e| e.id == id)
                    .ok_or_else(|| Error::NotFound(format!("mutation {id}")))?;
                let removed = entries.remove(pos);
                Ok(removed)
            })
            .await?;

        metrics::inbox_actions().add(
            1,
            &[
                KeyValue::new("action", "dismiss"),
                KeyValue::new("result", "dismissed"),
            ],
        );
        warn!(
            %id,
            mutation_type = %dismissed.mutation.mutation_type(),
            last_error = dismissed.last_error.as_deref().unwrap_or(""),
            "mutation dismissed without applying"
        );

        let report = FlushReport {
            dismissed: vec![id],
            ..FlushReport::default()
        };
        self.engine.settle(&report, counts, None);
        Ok(dismissed)
    }
}
