use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use trellis_core::event::EventBus;
use trellis_core::types::EngineEvent;

/// JSONL run logger.
///
/// Subscribes to the EventBus and writes one JSON object per line for a
/// single agent's run. Lines are flushed as they are written, so a crash
/// mid-run leaves every earlier line intact.
pub struct RunLogger {
    log_dir: PathBuf,
    level: u8,
}

#[derive(Debug, Serialize)]
struct LogEntry {
    timestamp: String,
    agent_id: String,
    event_type: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    detail: Option<serde_json::Value>,
}

impl RunLogger {
    /// Logs land in `{log_dir}/{agent_id}/{timestamp}.jsonl`.
    /// `level`: 1 = run summary, 2 = adds sessions and emissions,
    /// 3 = adds every node and usage update.
    pub fn new(log_dir: PathBuf, level: u8) -> Self {
        Self { log_dir, level }
    }

    /// Write events for `agent_id` until its run ends, `cancel` fires, or the
    /// bus closes.
    pub async fn run(self, events: Arc<EventBus>, agent_id: String, cancel: CancellationToken) {
        // Subscribe before any await so no early event is missed.
        let mut rx = events.subscribe();

        let agent_dir = self.log_dir.join(&agent_id);
        if let Err(e) = tokio::fs::create_dir_all(&agent_dir).await {
            error!(error = %e, "Failed to create log directory");
            return;
        }

        let timestamp = Utc::now().format("%Y%m%d_%H%M%S").to_string();
        let log_path = agent_dir.join(format!("{}.jsonl", timestamp));

        let file = match tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)
            .await
        {
            Ok(f) => f,
            Err(e) => {
                error!(error = %e, path = %log_path.display(), "Failed to open log file");
                return;
            }
        };

        info!(path = %log_path.display(), "RunLogger started");
        let mut writer = tokio::io::BufWriter::new(file);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("RunLogger cancelled");
                    break;
                }
                result = rx.recv() => {
                    match result {
                        Ok(event) => {
                            if event.agent_id() != agent_id {
                                continue;
                            }
                            let Some(entry) = self.entry_for(&event) else {
                                continue;
                            };
                            if let Ok(json) = serde_json::to_string(&entry) {
                                let line = format!("{}\n", json);
                                if let Err(e) = writer.write_all(line.as_bytes()).await {
                                    error!(error = %e, "Failed to write log entry");
                                    break;
                                }
                                if let Err(e) = writer.flush().await {
                                    error!(error = %e, "Failed to flush log");
                                }
                            }
                            if event.is_terminal() {
                                break;
                            }
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                            debug!(skipped = n, "RunLogger lagged, skipped events");
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Closed) => {
                            debug!("EventBus closed, RunLogger stopping");
                            break;
                        }
                    }
                }
            }
        }

        writer.flush().await.ok();
        debug!(path = %log_path.display(), "RunLogger finished");
    }

    /// Map an event to a log line, or `None` when the level filters it out.
    fn entry_for(&self, event: &EngineEvent) -> Option<LogEntry> {
        let (event_type, detail) = match event {
            EngineEvent::RunStarted { playbook, .. } => {
                ("run_started", Some(serde_json::json!({ "playbook": playbook })))
            }
            EngineEvent::RunCompleted {
                playbook,
                steps,
                outputs,
                ..
            } => (
                "run_completed",
                Some(serde_json::json!({
                    "playbook": playbook,
                    "steps": steps,
                    "outputs": outputs,
                })),
            ),
            EngineEvent::RunCancelled { playbook, .. } => {
                ("run_cancelled", Some(serde_json::json!({ "playbook": playbook })))
            }
            EngineEvent::RunFailed { playbook, error, .. } => (
                "run_failed",
                Some(serde_json::json!({ "playbook": playbook, "error": error })),
            ),

            EngineEvent::ThreadEntered {
                thread_id,
                depth,
                budget,
                ..
            } if self.level >= 2 => (
                "thread_entered",
                Some(serde_json::json!({
                    "thread_id": thread_id.0,
                    "depth": depth,
                    "budget": budget,
                })),
            ),
            EngineEvent::ThreadCompleted {
                thread_id, chronicle, ..
            } if self.level >= 2 => (
                "thread_completed",
                Some(serde_json::json!({ "thread_id": thread_id.0, "chronicle": chronicle })),
            ),
            EngineEvent::ThreadAborted { thread_id, .. } if self.level >= 2 => (
                "thread_aborted",
                Some(serde_json::json!({ "thread_id": thread_id.0 })),
            ),
            EngineEvent::OperationRejected { node_id, reason, .. } if self.level >= 2 => (
                "operation_rejected",
                Some(serde_json::json!({ "node_id": node_id, "reason": reason })),
            ),
            EngineEvent::Emitted { content, .. } if self.level >= 2 => (
                "emitted",
                Some(serde_json::json!({ "content": truncate_str(content, 200) })),
            ),

            EngineEvent::NodeStarted {
                playbook, node_id, step, ..
            } if self.level >= 3 => (
                "node_started",
                Some(serde_json::json!({
                    "playbook": playbook,
                    "node_id": node_id,
                    "step": step,
                })),
            ),
            EngineEvent::NodeCompleted {
                node_id, elapsed_ms, ..
            } if self.level >= 3 => (
                "node_completed",
                Some(serde_json::json!({ "node_id": node_id, "elapsed_ms": elapsed_ms })),
            ),
            EngineEvent::UsageUpdate {
                input_tokens,
                output_tokens,
                ..
            } if self.level >= 3 => (
                "usage_update",
                Some(serde_json::json!({
                    "input_tokens": input_tokens,
                    "output_tokens": output_tokens,
                })),
            ),

            _ => return None,
        };

        Some(LogEntry {
            timestamp: Utc::now().to_rfc3339(),
            agent_id: event.agent_id().to_string(),
            event_type,
            detail,
        })
    }
}

/// Truncate on a char boundary.
fn truncate_str(s: &str, max_len: usize) -> &str {
    if s.len() <= max_len {
        return s;
    }
    let mut end = max_len;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

#[cfg(test)]
mod tests {
    use super::*;
    use trellis_core::types::ThreadId;

    fn started() -> EngineEvent {
        EngineEvent::RunStarted {
            agent_id: "ada".into(),
            playbook: "greet".into(),
        }
    }

    fn entered() -> EngineEvent {
        EngineEvent::ThreadEntered {
            agent_id: "ada".into(),
            thread_id: ThreadId::from_str("t1"),
            depth: 1,
            budget: 8_000,
        }
    }

    fn node_started() -> EngineEvent {
        EngineEvent::NodeStarted {
            agent_id: "ada".into(),
            playbook: "greet".into(),
            node_id: "compose".into(),
            step: 1,
        }
    }

    #[test]
    fn test_event_level_filtering() {
        let l1 = RunLogger::new(PathBuf::from("/tmp"), 1);
        assert!(l1.entry_for(&started()).is_some());
        assert!(l1.entry_for(&entered()).is_none());
        assert!(l1.entry_for(&node_started()).is_none());

        let l2 = RunLogger::new(PathBuf::from("/tmp"), 2);
        assert!(l2.entry_for(&entered()).is_some());
        assert!(l2.entry_for(&node_started()).is_none());

        let l3 = RunLogger::new(PathBuf::from("/tmp"), 3);
        assert!(l3.entry_for(&node_started()).is_some());
    }

    #[test]
    fn test_entry_format() {
        let logger = RunLogger::new(PathBuf::from("/tmp"), 2);
        let entry = logger.entry_for(&entered()).unwrap();
        let json = serde_json::to_string(&entry).unwrap();
        assert!(json.contains("\"event_type\":\"thread_entered\""));
        assert!(json.contains("\"budget\":8000"));
        assert!(json.contains("\"agent_id\":\"ada\""));
    }

    #[test]
    fn test_truncate_respects_char_boundary() {
        assert_eq!(truncate_str("héllo", 2), "h");
        assert_eq!(truncate_str("short", 200), "short");
    }

    #[tokio::test]
    async fn test_writes_until_terminal_event() {
        let dir = tempfile::tempdir().unwrap();
        let bus = Arc::new(EventBus::new(16));
        let logger = RunLogger::new(dir.path().to_path_buf(), 1);
        let handle = tokio::spawn(logger.run(Arc::clone(&bus), "ada".into(), CancellationToken::new()));
        while bus.subscriber_count() == 0 {
            tokio::task::yield_now().await;
        }

        bus.publish(started());
        bus.publish(EngineEvent::RunStarted {
            agent_id: "bo".into(),
            playbook: "other".into(),
        });
        bus.publish(EngineEvent::RunCompleted {
            agent_id: "ada".into(),
            playbook: "greet".into(),
            steps: 2,
            outputs: 1,
        });
        handle.await.unwrap();

        let agent_dir = dir.path().join("ada");
        let file = std::fs::read_dir(&agent_dir).unwrap().next().unwrap().unwrap();
        let content = std::fs::read_to_string(file.path()).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].contains("run_started"));
        assert!(lines[1].contains("run_completed"));
    }
}
