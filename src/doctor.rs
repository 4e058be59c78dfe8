use std::time::Duration;

use trellis_core::config::AppConfig;
use trellis_core::policy::DefaultPolicy;
use trellis_core::traits::Policy;
use trellis_engine::tokens::estimate_tokens;
use trellis_store::SqliteStore;

struct CheckResult {
    label: String,
    ok: bool,
    detail: String,
}

/// Print each check and return the number of failures.
pub fn run_doctor(config: &AppConfig) -> usize {
    let policy = DefaultPolicy::from_config(&config.context);
    let checks = vec![
        check_config(config),
        check_database(config),
        check_log_dir(config),
        check_node_types(config, &policy),
        check_budget(config),
        check_tokenizer(),
    ];

    let mut ok_count = 0;
    let mut fail_count = 0;

    for check in &checks {
        let icon = if check.ok { "[OK]" } else { "[!!]" };
        println!("  {} {}: {}", icon, check.label, check.detail);
        if check.ok {
            ok_count += 1;
        } else {
            fail_count += 1;
        }
    }

    println!();
    println!("  {} passed, {} issues found", ok_count, fail_count);
    fail_count
}

fn check_config(config: &AppConfig) -> CheckResult {
    match config.validate() {
        Ok(()) => CheckResult {
            label: "Config".into(),
            ok: true,
            detail: format!(
                "lease {}s, claim limit {}, window {} turns",
                config.scheduler.lease_seconds, config.scheduler.claim_limit, config.context.window_turns
            ),
        },
        Err(e) => CheckResult {
            label: "Config".into(),
            ok: false,
            detail: e.to_string(),
        },
    }
}

fn check_database(config: &AppConfig) -> CheckResult {
    let db_path = config.store_path();
    if !db_path.exists() {
        return CheckResult {
            label: "Database".into(),
            ok: false,
            detail: format!("{} (does not exist, run `trellis init`)", db_path.display()),
        };
    }
    let opened = SqliteStore::open_with_timeout(&db_path, Duration::from_millis(config.store.busy_timeout_ms))
        .and_then(|store| store.graph_ids());
    match opened {
        Ok(graphs) => CheckResult {
            label: "Database".into(),
            ok: true,
            detail: format!("{} ({} graphs)", db_path.display(), graphs.len()),
        },
        Err(e) => CheckResult {
            label: "Database".into(),
            ok: false,
            detail: format!("{}: {}", db_path.display(), e),
        },
    }
}

fn check_log_dir(config: &AppConfig) -> CheckResult {
    let Some(dir) = config.log_dir() else {
        return CheckResult {
            label: "Event log".into(),
            ok: true,
            detail: "disabled".into(),
        };
    };
    if let Err(e) = std::fs::create_dir_all(&dir) {
        return CheckResult {
            label: "Event log".into(),
            ok: false,
            detail: format!("{} (cannot create: {})", dir.display(), e),
        };
    }
    // Check writable by attempting to create a temp file
    let test_file = dir.join(".doctor_test");
    match std::fs::write(&test_file, "test") {
        Ok(_) => {
            std::fs::remove_file(&test_file).ok();
            CheckResult {
                label: "Event log".into(),
                ok: true,
                detail: format!("{}", dir.display()),
            }
        }
        Err(e) => CheckResult {
            label: "Event log".into(),
            ok: false,
            detail: format!("{} (not writable: {})", dir.display(), e),
        },
    }
}

/// Pinned and tool node types must be types the policy knows.
fn check_node_types(config: &AppConfig, policy: &dyn Policy) -> CheckResult {
    let known = policy.node_types();
    let unknown: Vec<&str> = config
        .context
        .pinned_node_types
        .iter()
        .chain(config.budget.tool_node_types.iter())
        .filter(|t| !known.contains(*t))
        .map(|t| t.as_str())
        .collect();
    if unknown.is_empty() {
        CheckResult {
            label: "Node types".into(),
            ok: true,
            detail: format!("{} registered", known.len()),
        }
    } else {
        CheckResult {
            label: "Node types".into(),
            ok: false,
            detail: format!("unknown to the policy: {}", unknown.join(", ")),
        }
    }
}

fn check_budget(config: &AppConfig) -> CheckResult {
    match config.budget.limit() {
        Some(limit) => CheckResult {
            label: "Context budget".into(),
            ok: limit > 0,
            detail: format!(
                "{} prompt tokens ({} window, {} reserved)",
                limit,
                config.budget.context_window_tokens.unwrap_or_default(),
                config.budget.reserved_output_tokens
            ),
        },
        None => CheckResult {
            label: "Context budget".into(),
            ok: true,
            detail: "no window configured, contexts are not fitted".into(),
        },
    }
}

fn check_tokenizer() -> CheckResult {
    let tokens = estimate_tokens("The quick brown fox jumps over the lazy dog.");
    CheckResult {
        label: "Tokenizer".into(),
        ok: tokens > 0,
        detail: format!("sample sentence is {} tokens", tokens),
    }
}
