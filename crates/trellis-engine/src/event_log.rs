use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use trellis_core::event::EventBus;
use trellis_core::types::{EventType, GraphEvent, SubjectType};

/// JSONL graph-event logger.
///
/// Subscribes to the EventBus and appends one JSON object per committed
/// graph event. Lines are flushed as they are written, so a crash loses at
/// most the event in flight.
pub struct EventLogger {
    log_dir: PathBuf,
    /// Event types to record; empty records everything.
    only: Vec<EventType>,
}

#[derive(Serialize)]
struct LogEntry<'a> {
    timestamp: String,
    graph_id: &'a str,
    event_type: &'a str,
    subject_type: &'a SubjectType,
    subject_id: &'a str,
    #[serde(skip_serializing_if = "is_null")]
    particulars: &'a serde_json::Value,
}

fn is_null(value: &&serde_json::Value) -> bool {
    value.is_null()
}

impl EventLogger {
    /// Logs go to `{log_dir}/events-{timestamp}.jsonl`.
    pub fn new(log_dir: PathBuf) -> Self {
        Self {
            log_dir,
            only: Vec::new(),
        }
    }

    pub fn only(mut self, event_types: &[EventType]) -> Self {
        self.only = event_types.to_vec();
        self
    }

    /// Run as a background task until cancelled or the bus closes.
    pub async fn run(self, event_bus: Arc<EventBus>, cancel: CancellationToken) {
        if let Err(e) = tokio::fs::create_dir_all(&self.log_dir).await {
            error!(error = %e, "Failed to create log directory");
            return;
        }

        let timestamp = Utc::now().format("%Y%m%d_%H%M%S").to_string();
        let log_path = self.log_dir.join(format!("events-{}.jsonl", timestamp));

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

        info!(path = %log_path.display(), "EventLogger started");

        let mut writer = tokio::io::BufWriter::new(file);
        let mut rx = event_bus.subscribe();

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("EventLogger cancelled");
                    break;
                }
                result = rx.recv() => {
                    match result {
                        Ok(event) => {
                            let Some(line) = self.line(&event) else {
                                continue;
                            };
                            if let Err(e) = writer.write_all(line.as_bytes()).await {
                                error!(error = %e, "Failed to write log entry");
                                break;
                            }
                            if let Err(e) = writer.flush().await {
                                error!(error = %e, "Failed to flush log");
                            }
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                            debug!(skipped = n, "EventLogger lagged, skipped events");
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Closed) => {
                            debug!("EventBus closed, EventLogger stopping");
                            break;
                        }
                    }
                }
            }
        }

        writer.flush().await.ok();
        debug!(path = %log_path.display(), "EventLogger finished");
    }

    /// Serialized JSONL line, or `None` when the event type is filtered out.
    fn line(&self, event: &GraphEvent) -> Option<String> {
        if !self.only.is_empty() && !self.only.contains(&event.event_type) {
            return None;
        }
        let entry = LogEntry {
            timestamp: event.occurred_at.to_rfc3339(),
            graph_id: event.graph_id.as_str(),
            event_type: event.event_type.as_str(),
            subject_type: &event.subject_type,
            subject_id: &event.subject_id,
            particulars: &event.particulars,
        };
        serde_json::to_string(&entry).ok().map(|json| format!("{}\n", json))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use trellis_core::types::GraphId;

    fn event(event_type: EventType, particulars: serde_json::Value) -> GraphEvent {
        GraphEvent::new(&GraphId::from_string("g1"), event_type, SubjectType::Node, "n1", particulars)
    }

    #[test]
    fn test_jsonl_line_format() {
        let logger = EventLogger::new(PathBuf::from("/tmp"));
        let line = logger
            .line(&event(
                EventType::NodeStateChanged,
                serde_json::json!({"from": "running", "to": "finished"}),
            ))
            .unwrap();
        assert!(line.ends_with('\n'));
        let value: serde_json::Value = serde_json::from_str(line.trim_end()).unwrap();
        assert_eq!(value["graph_id"], "g1");
        assert_eq!(value["event_type"], "node_state_changed");
        assert_eq!(value["subject_type"], "node");
        assert_eq!(value["particulars"]["to"], "finished");
    }

    #[test]
    fn test_null_particulars_omitted() {
        let logger = EventLogger::new(PathBuf::from("/tmp"));
        let line = logger.line(&event(EventType::NodeCreated, serde_json::Value::Null)).unwrap();
        assert!(!line.contains("particulars"));
    }

    #[test]
    fn test_event_type_filter() {
        let logger = EventLogger::new(PathBuf::from("/tmp")).only(&[EventType::SubgraphCompressed]);
        assert!(logger.line(&event(EventType::NodeCreated, serde_json::json!({}))).is_none());
        assert!(logger
            .line(&event(EventType::SubgraphCompressed, serde_json::json!({})))
            .is_some());
    }

    #[tokio::test]
    async fn test_writes_bus_events_to_file() {
        let dir = tempfile::tempdir().unwrap();
        let bus = Arc::new(EventBus::new(16));
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(EventLogger::new(dir.path().to_path_buf()).run(bus.clone(), cancel.clone()));

        // Wait for the subscription before publishing.
        while bus.receiver_count() == 0 {
            tokio::task::yield_now().await;
        }
        bus.publish(event(EventType::NodeCreated, serde_json::json!({"node_type": "task"})));
        bus.publish(event(EventType::EdgeCreated, serde_json::json!({})));
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        cancel.cancel();
        handle.await.unwrap();

        let file = std::fs::read_dir(dir.path()).unwrap().next().unwrap().unwrap();
        let content = std::fs::read_to_string(file.path()).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].contains("node_created"));
    }
}
