//! Fit an assembled context into the model's token budget.
//!
//! Degradation runs in a fixed order and stops at the first step that fits:
//! drop retrieved memory, prune tool outputs (soft truncation, then hard
//! clearing of the oldest), then shrink the turn window one turn at a time,
//! pruning again at every size. Each step is recorded in the decision log.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use trellis_core::config::{BudgetConfig, ContextConfig};
use trellis_core::error::{Result, TokenBreakdown, TrellisError};
use trellis_core::traits::Summarizer;
use trellis_core::types::*;

use crate::context::{AssembledContext, ContextRequest, WindowedAssembler};
use crate::engine::GraphEngine;
use crate::tokens::{estimate_context_tokens, estimate_memory_tokens, estimate_tokens, truncate_middle};

/// One degradation step taken while fitting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum BudgetDecision {
    MemoryDropped { items: usize, tokens: usize, total: usize },
    SoftPrune { attempt: usize, chars_saved: usize, total: usize },
    HardClear { attempt: usize, cleared: usize, chars_saved: usize, total: usize },
    TurnsShrunk { turns: usize, total: usize },
    AutoCompactTriggered { compressed: usize, summary_id: NodeId },
    AutoCompactFailed { reason: String },
    Fit { total: usize, limit: usize },
}

/// A context that fits, with the decisions that got it there.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FittedContext {
    pub entries: Vec<ContextEntry>,
    pub memory: Vec<String>,
    pub estimated: TokenBreakdown,
    /// Window size of the final assembly.
    pub window_turns: Option<usize>,
    pub decisions: Vec<BudgetDecision>,
}

pub struct ContextBudgetManager {
    budget: BudgetConfig,
    context: ContextConfig,
    summarizer: Option<Arc<dyn Summarizer>>,
}

impl ContextBudgetManager {
    pub fn new(budget: BudgetConfig, context: ContextConfig) -> Self {
        Self {
            budget,
            context,
            summarizer: None,
        }
    }

    pub fn with_summarizer(mut self, summarizer: Arc<dyn Summarizer>) -> Self {
        self.summarizer = Some(summarizer);
        self
    }

    pub fn budget(&self) -> &BudgetConfig {
        &self.budget
    }

    /// Assemble the windowed context for `target` and degrade it until it
    /// fits. Fails with `ContextWindowExceeded` when even a single turn is
    /// too large.
    pub async fn fit(
        &self,
        engine: &GraphEngine,
        graph_id: &GraphId,
        target: &NodeId,
        memory: Vec<String>,
    ) -> Result<FittedContext> {
        let assembler = WindowedAssembler::from_config(&self.context);
        let request = ContextRequest::new(target.clone()).with_mode(self.context.mode);
        let assembled = engine.assemble(graph_id, &assembler, &request)?;
        let mut window = window_turns(&assembled);
        let mut entries = assembled.entries;
        let mut memory = memory;
        let mut decisions = Vec::new();

        let Some(limit) = self.budget.limit() else {
            let estimated = breakdown(&entries, &memory, 0);
            return Ok(FittedContext {
                entries,
                memory,
                estimated,
                window_turns: window,
                decisions,
            });
        };

        let fitted = |entries: Vec<ContextEntry>, memory: Vec<String>, window: Option<usize>, mut decisions: Vec<BudgetDecision>| {
            let estimated = breakdown(&entries, &memory, limit);
            decisions.push(BudgetDecision::Fit {
                total: estimated.total,
                limit,
            });
            debug!(node_id = %target, total = estimated.total, limit, steps = decisions.len(), "Context fits budget");
            FittedContext {
                entries,
                memory,
                estimated,
                window_turns: window,
                decisions,
            }
        };

        if breakdown(&entries, &memory, limit).total <= limit {
            return Ok(fitted(entries, memory, window, decisions));
        }

        if !memory.is_empty() {
            let items = memory.len();
            let tokens = estimate_memory_tokens(&memory);
            memory.clear();
            let total = breakdown(&entries, &memory, limit).total;
            decisions.push(BudgetDecision::MemoryDropped { items, tokens, total });
            if total <= limit {
                return Ok(fitted(entries, memory, window, decisions));
            }
        }

        let mut attempt = 1;
        if self.prune(&mut entries, target, &memory, limit, attempt, &mut decisions) {
            return Ok(fitted(entries, memory, window, decisions));
        }

        let mut last = breakdown(&entries, &memory, limit);
        let start = window.map_or(0, |w| w.min(self.context.window_turns));
        let mut previous_turns: Vec<TurnId> = Vec::new();
        if let Some(scope) = &assembled.scope {
            previous_turns = scope.window_turn_ids.clone();
        }
        let mut compacted = false;
        let mut n = start.saturating_sub(1);
        while n >= 1 {
            let shrunk = assembler.with_window(n);
            let mut rebuilt = engine.assemble(graph_id, &shrunk, &request)?;
            info!(node_id = %target, turns = n, "Context window shrunk");

            if self.budget.auto_compact && !compacted {
                compacted = true;
                let kept: HashSet<TurnId> = rebuilt
                    .scope
                    .as_ref()
                    .map(|s| s.window_turn_ids.iter().cloned().collect())
                    .unwrap_or_default();
                let dropped: Vec<TurnId> = previous_turns.iter().filter(|t| !kept.contains(*t)).cloned().collect();
                match self.auto_compact(engine, graph_id, &dropped).await {
                    Ok(Some((compressed, summary_id))) => {
                        info!(node_id = %target, compressed, summary_id = %summary_id, "Auto-compaction compressed dropped turns");
                        decisions.push(BudgetDecision::AutoCompactTriggered { compressed, summary_id });
                        rebuilt = engine.assemble(graph_id, &shrunk, &request)?;
                    }
                    Ok(None) => {}
                    Err(e) => {
                        warn!(node_id = %target, error = %e, "Auto-compaction failed");
                        decisions.push(BudgetDecision::AutoCompactFailed { reason: e.to_string() });
                    }
                }
            }

            window = window_turns(&rebuilt);
            if let Some(scope) = &rebuilt.scope {
                previous_turns = scope.window_turn_ids.clone();
            }
            // Entries kept from the wider window keep their pruned outputs.
            let pruned: HashMap<&NodeId, &Map> = entries.iter().map(|e| (&e.node_id, &e.output)).collect();
            for entry in &mut rebuilt.entries {
                if let Some(output) = pruned.get(&entry.node_id) {
                    entry.output = (*output).clone();
                }
            }
            entries = rebuilt.entries;
            decisions.push(BudgetDecision::TurnsShrunk {
                turns: n,
                total: breakdown(&entries, &memory, limit).total,
            });
            attempt += 1;
            if self.prune(&mut entries, target, &memory, limit, attempt, &mut decisions) {
                return Ok(fitted(entries, memory, window, decisions));
            }
            last = breakdown(&entries, &memory, limit);
            n -= 1;
        }

        warn!(node_id = %target, total = last.total, limit, "Context window exceeded");
        Err(TrellisError::ContextWindowExceeded { estimated: last })
    }

    /// Soft then hard tool-output pruning. Returns whether the entries,
    /// plus whatever memory is still attached, fit.
    fn prune(
        &self,
        entries: &mut [ContextEntry],
        target: &NodeId,
        memory: &[String],
        limit: usize,
        attempt: usize,
        decisions: &mut Vec<BudgetDecision>,
    ) -> bool {
        let reserved = estimate_memory_tokens(memory);
        if fits(entries, reserved, limit) {
            return true;
        }
        let tools: Vec<usize> = entries
            .iter()
            .enumerate()
            .filter(|(_, e)| self.budget.tool_node_types.contains(&e.node_type))
            .map(|(i, _)| i)
            .collect();
        if tools.is_empty() {
            return false;
        }

        let mut chars_saved = 0;
        for &i in &tools {
            for value in entries[i].output.values_mut() {
                let Value::String(text) = value else {
                    continue;
                };
                let before = text.chars().count();
                if before <= self.budget.soft_prune_max_chars {
                    continue;
                }
                let cut = truncate_middle(text, self.budget.soft_prune_head_chars, self.budget.soft_prune_tail_chars);
                let after = cut.chars().count();
                if after < before {
                    chars_saved += before - after;
                    *text = cut;
                }
            }
        }
        if chars_saved > 0 {
            decisions.push(BudgetDecision::SoftPrune {
                attempt,
                chars_saved,
                total: estimate_context_tokens(entries) + reserved,
            });
            if fits(entries, reserved, limit) {
                return true;
            }
        }

        let total: usize = tools.iter().map(|&i| output_chars(&entries[i].output)).sum();
        if total < self.budget.hard_clear_min_total_chars {
            return false;
        }
        let placeholder = {
            let mut map = Map::new();
            map.insert("content".into(), json!(self.budget.hard_clear_placeholder));
            map
        };
        let placeholder_chars = output_chars(&placeholder);
        let placeholder_tokens = output_tokens(&placeholder);
        let mut cleared = 0;
        let mut hard_saved = 0;
        let mut fit = false;
        for &i in &tools {
            if entries[i].node_id == *target {
                continue;
            }
            // Outputs no larger than the placeholder would only grow.
            let before = output_chars(&entries[i].output);
            if before <= placeholder_chars || output_tokens(&entries[i].output) <= placeholder_tokens {
                continue;
            }
            entries[i].output = placeholder.clone();
            hard_saved += before - placeholder_chars;
            cleared += 1;
            if fits(entries, reserved, limit) {
                fit = true;
                break;
            }
        }
        if cleared > 0 {
            decisions.push(BudgetDecision::HardClear {
                attempt,
                cleared,
                chars_saved: hard_saved,
                total: estimate_context_tokens(entries) + reserved,
            });
        }
        fit
    }

    /// Summarize the finished nodes of the dropped turns and compress them.
    async fn auto_compact(
        &self,
        engine: &GraphEngine,
        graph_id: &GraphId,
        dropped: &[TurnId],
    ) -> Result<Option<(usize, NodeId)>> {
        let Some(summarizer) = &self.summarizer else {
            return Ok(None);
        };
        if dropped.is_empty() {
            return Ok(None);
        }
        let nodes: Vec<Node> = engine
            .read(graph_id, |rows| rows.active_nodes_in_turns(dropped))?
            .into_iter()
            .filter(|n| n.state == NodeState::Finished)
            .filter(|n| !self.context.pinned_node_types.contains(&n.node_type))
            .collect();
        if nodes.is_empty() {
            return Ok(None);
        }
        let slice: Vec<ContextEntry> = nodes.iter().map(|n| ContextEntry::project(n, ContextMode::Full)).collect();
        let summary = summarizer.summarize(slice).await?;
        let ids: Vec<NodeId> = nodes.into_iter().map(|n| n.id).collect();
        let mut metadata = Map::new();
        metadata.insert("generated_by".into(), json!("auto_compact"));
        metadata.insert("turn_ids".into(), json!(dropped));
        let node = engine.compress(graph_id, &ids, &summary, metadata)?;
        Ok(Some((ids.len(), node.id)))
    }
}

fn window_turns(assembled: &AssembledContext) -> Option<usize> {
    assembled.scope.as_ref().map(|s| s.window_turn_ids.len())
}

fn fits(entries: &[ContextEntry], reserved: usize, limit: usize) -> bool {
    estimate_context_tokens(entries) + reserved <= limit
}

fn output_chars(output: &Map) -> usize {
    serde_json::to_string(output).map(|s| s.chars().count()).unwrap_or_default()
}

fn output_tokens(output: &Map) -> usize {
    estimate_tokens(&serde_json::to_string(output).unwrap_or_default())
}

fn breakdown(entries: &[ContextEntry], memory: &[String], limit: usize) -> TokenBreakdown {
    let context = estimate_context_tokens(entries);
    let memory = estimate_memory_tokens(memory);
    TokenBreakdown {
        context,
        memory,
        total: context + memory,
        limit,
    }
}
