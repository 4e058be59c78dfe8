use std::sync::OnceLock;

use tiktoken_rs::CoreBPE;
use tracing::warn;

use trellis_core::types::ContextEntry;

/// cl100k_base tokenizer, or `None` if it failed to load.
fn tokenizer() -> Option<&'static CoreBPE> {
    static TOKENIZER: OnceLock<Option<CoreBPE>> = OnceLock::new();
    TOKENIZER
        .get_or_init(|| match tiktoken_rs::cl100k_base() {
            Ok(bpe) => Some(bpe),
            Err(e) => {
                warn!(error = %e, "Failed to load cl100k_base tokenizer, estimating by length");
                None
            }
        })
        .as_ref()
}

/// BPE token count, falling back to a chars/4 estimate.
pub fn estimate_tokens(text: &str) -> usize {
    match tokenizer() {
        Some(bpe) => bpe.encode_ordinary(text).len(),
        None => text.chars().count().div_ceil(4),
    }
}

/// Tokens for one context entry: its serialized payload plus 4 tokens of
/// framing overhead.
pub fn estimate_entry_tokens(entry: &ContextEntry) -> usize {
    let input = serde_json::to_string(&entry.input).unwrap_or_default();
    let output = serde_json::to_string(&entry.output).unwrap_or_default();
    estimate_tokens(&entry.node_type) + estimate_tokens(&input) + estimate_tokens(&output) + 4
}

pub fn estimate_context_tokens(entries: &[ContextEntry]) -> usize {
    entries.iter().map(estimate_entry_tokens).sum()
}

pub fn estimate_memory_tokens(memory: &[String]) -> usize {
    memory.iter().map(|m| estimate_tokens(m) + 4).sum()
}

/// Keep the first `head` and last `tail` characters of `text`, joined by an
/// elision marker. Text that is already short enough is returned unchanged.
pub fn truncate_middle(text: &str, head: usize, tail: usize) -> String {
    let total = text.chars().count();
    if total <= head + tail {
        return text.to_string();
    }
    let start: String = text.chars().take(head).collect();
    let end: String = text.chars().skip(total - tail).collect();
    format!("{}\n[… {} chars truncated …]\n{}", start, total - head - tail, end)
}
