//! Periodic removal of ended tasks whose retention window has elapsed.

use std::sync::Arc;

use serde_json::{json, Value};
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use super::model::TaskStatus;
use super::tasker::TaskerInner;
use crate::core::Result;

/// Ended tasks whose `endedAt + archiving.duration` lies in the past.
fn expired_pipeline() -> Vec<Value> {
    vec![
        json!({"$match": {
            "status": {"$in": TaskStatus::TERMINAL},
            "archiving.duration": {"$exists": true},
            "endedAt": {"$exists": true},
            "$expr": {"$lt": [
                {"$dateAdd": {
                    "startDate": "$endedAt",
                    "unit": "millisecond",
                    "amount": "$archiving.duration",
                }},
                "$$NOW",
            ]},
        }}),
        json!({"$project": {"uuid": 1}}),
    ]
}

impl TaskerInner {
    /// Removes expired tasks together with their logs.
    pub(crate) fn clean_ended_tasks(&self) -> Result<usize> {
        let uuids: Vec<Value> = self
            .tasks
            .aggregate(&expired_pipeline())?
            .into_iter()
            .filter_map(|doc| doc.get("uuid").cloned())
            .collect();
        if uuids.is_empty() {
            debug!("No ended tasks to archive");
            return Ok(0);
        }

        let removed = self.tasks.remove(&json!({"uuid": {"$in": uuids}}))?;
        let logs = self.logs.remove(&json!({"taskUuid": {"$in": uuids}}))?;
        info!(tasks = removed, logs, "Archived ended tasks");
        Ok(removed)
    }

    /// Periodic sweep. The eager run happens in `start()`, so the first tick
    /// is one full interval away.
    pub(crate) async fn run_archiver(self: Arc<Self>, shutdown: CancellationToken) {
        let period = self.config.archive_interval;
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.clean_ended_tasks() {
                        error!(error = %e, "Archiving failed");
                    }
                }
            }
        }
        debug!("Archiver stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Collection;
    use chrono::Utc;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_pipeline_selects_only_expired_terminal_tasks() {
        let tasks = Collection::in_memory("tasks");
        let now = Utc::now().timestamp_millis();
        let docs = [
            json!({"uuid": "old", "status": "done", "endedAt": now - 2000, "archiving": {"duration": 1000}}),
            json!({"uuid": "fresh", "status": "failed", "endedAt": now, "archiving": {"duration": 60_000}}),
            json!({"uuid": "kept", "status": "done", "endedAt": now - 2000}),
            json!({"uuid": "live", "status": "running", "archiving": {"duration": 0}}),
        ];
        for doc in docs {
            tasks.insert(doc).unwrap();
        }

        let selected: Vec<Value> = tasks
            .aggregate(&expired_pipeline())
            .unwrap()
            .into_iter()
            .map(|doc| doc["uuid"].clone())
            .collect();
        assert_eq!(selected, vec![json!("old")]);
    }
}
