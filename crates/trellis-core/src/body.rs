use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;

use crate::types::{node_types, Map};

/// Default number of characters kept in an output preview.
pub const DEFAULT_PREVIEW_CHARS: usize = 2000;

/// Capabilities of a node body class.
///
/// The host registers one body per node type; the core only asks these
/// questions and never inspects payload shapes directly.
pub trait NodeBody: Send + Sync + 'static {
    /// Body class name persisted alongside the node.
    fn kind(&self) -> &str;

    /// Pending nodes of this body are picked up by the scheduler.
    fn executable(&self) -> bool {
        false
    }

    fn retriable(&self) -> bool {
        false
    }

    fn regeneratable(&self) -> bool {
        false
    }

    fn editable(&self) -> bool {
        false
    }

    /// Input carried forward to a retry replacement.
    fn retry_input(&self, input: &Map) -> Map {
        input.clone()
    }

    /// Small projection of the output used by preview-mode context assembly.
    fn output_preview(&self, output: &Map) -> Map {
        preview_map(output, DEFAULT_PREVIEW_CHARS)
    }
}

/// Truncate every string value in `output` to `max_chars` characters.
pub fn preview_map(output: &Map, max_chars: usize) -> Map {
    output
        .iter()
        .map(|(k, v)| {
            let v = match v {
                Value::String(s) if s.chars().count() > max_chars => {
                    let mut cut: String = s.chars().take(max_chars).collect();
                    cut.push('…');
                    Value::String(cut)
                }
                Value::String(_) | Value::Number(_) | Value::Bool(_) | Value::Null => v.clone(),
                other => {
                    let raw = other.to_string();
                    if raw.chars().count() > max_chars {
                        Value::String(raw.chars().take(max_chars).collect::<String>() + "…")
                    } else {
                        other.clone()
                    }
                }
            };
            (k.clone(), v)
        })
        .collect()
}

/// Body class described by flags; covers the built-in node types.
#[derive(Debug, Clone)]
pub struct StandardBody {
    kind: String,
    executable: bool,
    retriable: bool,
    regeneratable: bool,
    editable: bool,
    preview_chars: usize,
}

impl StandardBody {
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            executable: false,
            retriable: false,
            regeneratable: false,
            editable: false,
            preview_chars: DEFAULT_PREVIEW_CHARS,
        }
    }

    pub fn executable(mut self) -> Self {
        self.executable = true;
        self
    }

    pub fn retriable(mut self) -> Self {
        self.retriable = true;
        self
    }

    pub fn regeneratable(mut self) -> Self {
        self.regeneratable = true;
        self
    }

    pub fn editable(mut self) -> Self {
        self.editable = true;
        self
    }

    pub fn with_preview_chars(mut self, chars: usize) -> Self {
        self.preview_chars = chars;
        self
    }
}

impl NodeBody for StandardBody {
    fn kind(&self) -> &str {
        &self.kind
    }

    fn executable(&self) -> bool {
        self.executable
    }

    fn retriable(&self) -> bool {
        self.retriable
    }

    fn regeneratable(&self) -> bool {
        self.regeneratable
    }

    fn editable(&self) -> bool {
        self.editable
    }

    fn retry_input(&self, input: &Map) -> Map {
        // Attempt bookkeeping is per-run and must not leak into the replacement.
        input
            .iter()
            .filter(|(k, _)| !k.starts_with('_'))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    fn output_preview(&self, output: &Map) -> Map {
        preview_map(output, self.preview_chars)
    }
}

/// Node-type -> body-class mapping.
#[derive(Clone, Default)]
pub struct BodyRegistry {
    bodies: HashMap<String, Arc<dyn NodeBody>>,
}

impl BodyRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in message, task, and summary types.
    pub fn with_defaults() -> Self {
        Self::with_preview_chars(DEFAULT_PREVIEW_CHARS)
    }

    /// Built-in types whose previews keep `chars` characters per string.
    pub fn with_preview_chars(chars: usize) -> Self {
        let body = |kind: &str| StandardBody::new(kind).with_preview_chars(chars);
        let mut registry = Self::new();
        registry.register(node_types::USER_MESSAGE, body("user_message").editable());
        registry.register(
            node_types::AGENT_MESSAGE,
            body("agent_message").executable().retriable().regeneratable(),
        );
        registry.register(node_types::TASK, body("task").executable().retriable());
        registry.register(node_types::SUMMARY, body("summary"));
        registry.register(node_types::SYSTEM_MESSAGE, body("system_message").editable());
        registry.register(node_types::DEVELOPER_MESSAGE, body("developer_message").editable());
        registry
    }

    pub fn register(&mut self, node_type: impl Into<String>, body: impl NodeBody) {
        self.bodies.insert(node_type.into(), Arc::new(body));
    }

    pub fn get(&self, node_type: &str) -> Option<Arc<dyn NodeBody>> {
        self.bodies.get(node_type).cloned()
    }

    pub fn node_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.bodies.keys().cloned().collect();
        types.sort();
        types
    }
}

impl std::fmt::Debug for BodyRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BodyRegistry")
            .field("node_types", &self.node_types())
            .finish()
    }
}
