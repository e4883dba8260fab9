use std::path::PathBuf;

use chrono::Utc;
use serde::Serialize;
use serde_json::json;
use tokio::io::AsyncWriteExt;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use weft_core::{EngineEvent, RunId};

/// Writes one run's events to `{log_dir}/{run_id}/{timestamp}.jsonl`.
///
/// Lines are flushed as they are written so a crash leaves every earlier
/// entry intact. `level` picks verbosity: 1 = run, 2 = nodes, 3 = transforms
/// and confirmations.
pub struct RunLogger {
    log_dir: PathBuf,
    level: u8,
}

#[derive(Debug, Serialize)]
struct LogEntry {
    timestamp: String,
    run_id: String,
    event_type: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    node_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    detail: Option<serde_json::Value>,
}

impl RunLogger {
    pub fn new(log_dir: PathBuf, level: u8) -> Self {
        Self { log_dir, level }
    }

    /// Consume events for `run_id` until its `RunFinished`, cancellation or bus close.
    ///
    /// Takes a receiver rather than the bus so the caller can subscribe before
    /// the run publishes its first event.
    pub async fn run(
        self,
        mut rx: broadcast::Receiver<EngineEvent>,
        run_id: RunId,
        cancel: CancellationToken,
    ) {
        let run_dir = self.log_dir.join(run_id.as_str());
        if let Err(e) = tokio::fs::create_dir_all(&run_dir).await {
            error!(error = %e, "Failed to create run log directory");
            return;
        }

        let timestamp = Utc::now().format("%Y%m%d_%H%M%S").to_string();
        let log_path = run_dir.join(format!("{}.jsonl", timestamp));

        let file = match tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)
            .await
        {
            Ok(f) => f,
            Err(e) => {
                error!(error = %e, path = %log_path.display(), "Failed to open run log");
                return;
            }
        };

        info!(path = %log_path.display(), run_id = %run_id, "Run log started");
        let mut writer = tokio::io::BufWriter::new(file);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("Run log cancelled");
                    break;
                }
                result = rx.recv() => match result {
                    Ok(event) => {
                        if event.run_id() != Some(&run_id) {
                            continue;
                        }
                        if let Some(entry) = self.event_to_entry(&event) {
                            if let Ok(line) = serde_json::to_string(&entry) {
                                if let Err(e) = writer.write_all(format!("{}\n", line).as_bytes()).await {
                                    error!(error = %e, "Failed to write run log entry");
                                    break;
                                }
                                if let Err(e) = writer.flush().await {
                                    error!(error = %e, "Failed to flush run log");
                                }
                            }
                        }
                        if matches!(event, EngineEvent::RunFinished { .. }) {
                            break;
                        }
                    }
                    Err(RecvError::Lagged(n)) => {
                        debug!(skipped = n, "Run log lagged, skipped events");
                    }
                    Err(RecvError::Closed) => {
                        debug!("Event bus closed, run log stopping");
                        break;
                    }
                }
            }
        }

        writer.flush().await.ok();
        debug!(path = %log_path.display(), "Run log finished");
    }

    fn event_to_entry(&self, event: &EngineEvent) -> Option<LogEntry> {
        let run_id = event.run_id()?.to_string();
        let entry = |event_type: &'static str, node_id: Option<&str>, detail: Option<serde_json::Value>| LogEntry {
            timestamp: Utc::now().to_rfc3339(),
            run_id: run_id.clone(),
            event_type,
            node_id: node_id.map(str::to_string),
            detail,
        };

        match event {
            EngineEvent::RunStarted { nodes, .. } => {
                Some(entry("run_started", None, Some(json!({ "nodes": nodes }))))
            }
            EngineEvent::RunFinished {
                status, total_cost, ..
            } => Some(entry(
                "run_finished",
                None,
                Some(json!({ "status": status, "total_cost": total_cost })),
            )),

            EngineEvent::NodeStarted { node_id, .. } if self.level >= 2 => {
                Some(entry("node_started", Some(node_id.as_str()), None))
            }
            EngineEvent::NodeCompleted {
                node_id,
                cost,
                duration_ms,
                ..
            } if self.level >= 2 => Some(entry(
                "node_completed",
                Some(node_id.as_str()),
                Some(json!({ "cost": cost, "duration_ms": duration_ms })),
            )),
            EngineEvent::NodeFailed { node_id, error, .. } if self.level >= 2 => Some(entry(
                "node_failed",
                Some(node_id.as_str()),
                Some(json!({ "kind": error.kind, "message": error.message })),
            )),

            EngineEvent::TransformApplied {
                edge_id,
                method,
                succeeded,
                cost,
                ..
            } if self.level >= 3 => Some(entry(
                "transform_applied",
                None,
                Some(json!({
                    "edge_id": edge_id,
                    "method": method,
                    "succeeded": succeeded,
                    "cost": cost,
                })),
            )),
            EngineEvent::ConfirmationRequested { request } if self.level >= 3 => Some(entry(
                "confirmation_requested",
                Some(request.node_id.as_str()),
                Some(json!({
                    "request_id": request.id,
                    "edge_id": request.edge_id,
                    "estimated_cost": request.estimated_cost,
                })),
            )),

            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use weft_core::{EventBus, RunError, ErrorKind, RunStatus};

    fn started(id: &str) -> EngineEvent {
        EngineEvent::RunStarted {
            run_id: RunId::from_str(id),
            nodes: 2,
        }
    }

    #[test]
    fn level_filtering() {
        let node_failed = EngineEvent::NodeFailed {
            run_id: RunId::from_str("r"),
            node_id: "n".into(),
            error: RunError::new(ErrorKind::AgentInvocation, "boom"),
        };

        let l1 = RunLogger::new(PathBuf::from("/tmp"), 1);
        assert!(l1.event_to_entry(&started("r")).is_some());
        assert!(l1.event_to_entry(&node_failed).is_none());

        let l2 = RunLogger::new(PathBuf::from("/tmp"), 2);
        let entry = l2.event_to_entry(&node_failed).unwrap();
        assert_eq!(entry.event_type, "node_failed");
        assert_eq!(entry.node_id.as_deref(), Some("n"));
    }

    #[tokio::test]
    async fn writes_only_own_run_and_stops_on_finish() {
        let dir = tempfile::tempdir().unwrap();
        let bus = EventBus::new(16);
        let rx = bus.subscribe();
        let run_id = RunId::from_str("run-1");

        let logger = RunLogger::new(dir.path().to_path_buf(), 1);
        let handle = tokio::spawn(logger.run(rx, run_id.clone(), CancellationToken::new()));

        bus.publish(started("run-1"));
        bus.publish(started("other"));
        bus.publish(EngineEvent::RunFinished {
            run_id: run_id.clone(),
            status: RunStatus::Succeeded,
            total_cost: 0.5,
        });
        handle.await.unwrap();

        let run_dir = dir.path().join("run-1");
        let mut entries = std::fs::read_dir(&run_dir).unwrap();
        let path = entries.next().unwrap().unwrap().path();
        let content = std::fs::read_to_string(path).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].contains("run_started"));
        assert!(lines[1].contains("\"status\":\"succeeded\""));
        assert!(!dir.path().join("other").exists());
    }
}
