use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use tracing::warn;

use crate::traits::EventSink;
use crate::types::GraphEvent;

/// Fan-out of audit events to host sinks.
/// Fire-and-forget: errors and panics are logged, not propagated.
#[derive(Clone, Default)]
pub struct EventHooks {
    sinks: Vec<Arc<dyn EventSink>>,
}

impl EventHooks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    pub fn add_sink(&mut self, sink: Arc<dyn EventSink>) {
        self.sinks.push(sink);
    }

    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }

    pub fn dispatch(&self, events: &[GraphEvent]) {
        for event in events {
            for sink in &self.sinks {
                match catch_unwind(AssertUnwindSafe(|| sink.record_event(event))) {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => warn!(
                        graph_id = %event.graph_id,
                        event_type = event.event_type.as_str(),
                        error = %e,
                        "Event hook failed"
                    ),
                    Err(_) => warn!(
                        graph_id = %event.graph_id,
                        event_type = event.event_type.as_str(),
                        "Event hook panicked"
                    ),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{Result, TrellisError};
    use crate::types::{EventType, GraphId, SubjectType};
    use std::sync::Mutex;

    struct Failing;

    impl EventSink for Failing {
        fn record_event(&self, _event: &GraphEvent) -> Result<()> {
            Err(TrellisError::Database("sink offline".into()))
        }
    }

    struct Panicking;

    impl EventSink for Panicking {
        fn record_event(&self, _event: &GraphEvent) -> Result<()> {
            panic!("boom")
        }
    }

    #[derive(Default)]
    struct Collect(Mutex<Vec<EventType>>);

    impl EventSink for Collect {
        fn record_event(&self, event: &GraphEvent) -> Result<()> {
            self.0.lock().unwrap().push(event.event_type);
            Ok(())
        }
    }

    #[test]
    fn test_failing_sinks_do_not_block_others() {
        let collect = Arc::new(Collect::default());
        let hooks = EventHooks::new()
            .with_sink(Arc::new(Failing))
            .with_sink(Arc::new(Panicking))
            .with_sink(collect.clone());

        let graph = GraphId::new();
        hooks.dispatch(&[GraphEvent::new(
            &graph,
            EventType::NodeStateChanged,
            SubjectType::Node,
            "n1",
            serde_json::json!({"from": "running", "to": "finished"}),
        )]);

        assert_eq!(*collect.0.lock().unwrap(), vec![EventType::NodeStateChanged]);
    }
}
