use std::net::SocketAddr;
use std::path::Path;

use visitflow_core::config::{AppConfig, RetryConfig};
use visitflow_core::graph::WorkflowGraph;
use visitflow_core::types::Workflow;

struct CheckResult {
    label: String,
    ok: bool,
    detail: String,
}

impl CheckResult {
    fn ok(label: &str, detail: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            ok: true,
            detail: detail.into(),
        }
    }

    fn issue(label: &str, detail: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            ok: false,
            detail: detail.into(),
        }
    }
}

pub fn run_doctor(config: &AppConfig) {
    let checks = vec![
        check_database(config),
        check_workflows(&config.workflows_dir()),
        check_gateway(config),
        check_email(config),
        check_webhook(config),
        check_retry("Retry (default)", &config.retry.default),
        check_retry("Retry (webhook)", &config.retry.webhook),
        check_retry("Retry (email)", &config.retry.email),
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
}

fn check_database(config: &AppConfig) -> CheckResult {
    let db_path = config.database_path();
    match visitflow_store::SqliteStore::open(&db_path) {
        Ok(store) => match store.event_count() {
            Ok(n) => CheckResult::ok("Database", format!("{} ({} events)", db_path.display(), n)),
            Err(e) => CheckResult::issue("Database", format!("{}: {}", db_path.display(), e)),
        },
        Err(e) => CheckResult::issue("Database", format!("{}: {}", db_path.display(), e)),
    }
}

fn check_workflows(dir: &Path) -> CheckResult {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(_) => {
            return CheckResult::issue("Workflows", format!("{} (does not exist)", dir.display()))
        }
    };

    let mut valid = 0;
    let mut issues = Vec::new();
    for path in entries.flatten().map(|e| e.path()) {
        if path.extension().map_or(true, |ext| ext != "json") {
            continue;
        }
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let parsed = std::fs::read_to_string(&path)
            .map_err(|e| e.to_string())
            .and_then(|text| parse_workflows(&text).map_err(|e| e.to_string()));
        match parsed {
            Ok(workflows) => {
                for workflow in workflows {
                    let id = workflow.id.clone();
                    match WorkflowGraph::new(workflow) {
                        Ok(graph) if graph.unreachable().is_empty() => valid += 1,
                        Ok(graph) => {
                            valid += 1;
                            issues.push(format!("{}: {} unreachable nodes", id, graph.unreachable().len()));
                        }
                        Err(e) => issues.push(format!("{}: {}", id, e)),
                    }
                }
            }
            Err(e) => issues.push(format!("{}: {}", name, e)),
        }
    }

    if issues.is_empty() {
        CheckResult::ok("Workflows", format!("{} valid in {}", valid, dir.display()))
    } else {
        CheckResult::issue("Workflows", format!("{} valid; {}", valid, issues.join(", ")))
    }
}

fn parse_workflows(text: &str) -> serde_json::Result<Vec<Workflow>> {
    match serde_json::from_str::<serde_json::Value>(text)? {
        serde_json::Value::Array(items) => items.into_iter().map(serde_json::from_value).collect(),
        single => Ok(vec![serde_json::from_value(single)?]),
    }
}

fn check_gateway(config: &AppConfig) -> CheckResult {
    match config.gateway.bind.parse::<SocketAddr>() {
        Ok(addr) if addr.ip().is_loopback() => {
            CheckResult::ok("Gateway", format!("{} (loopback only)", addr))
        }
        Ok(addr) => CheckResult::ok("Gateway", addr.to_string()),
        Err(e) => CheckResult::issue("Gateway", format!("invalid bind '{}': {}", config.gateway.bind, e)),
    }
}

fn check_email(config: &AppConfig) -> CheckResult {
    match config.email.effective_api_key() {
        Some(_) => CheckResult::ok("Email", format!("Resend API via {}", config.email.base_url)),
        None => CheckResult::ok("Email", "No API key; deliveries are simulated"),
    }
}

fn check_webhook(config: &AppConfig) -> CheckResult {
    let secret = config
        .webhook
        .hmac_secret
        .as_deref()
        .filter(|s| !s.trim().is_empty());
    match secret {
        Some(s) if s.starts_with("${") => {
            CheckResult::issue("Webhook signing", format!("secret references unset variable {}", s))
        }
        Some(_) => CheckResult::ok(
            "Webhook signing",
            format!("HMAC-SHA256 in {}", config.webhook.signature_header),
        ),
        None => CheckResult::ok("Webhook signing", "disabled"),
    }
}

fn check_retry(label: &str, retry: &RetryConfig) -> CheckResult {
    if retry.max_attempts == 0 {
        return CheckResult::issue(label, "max_attempts is 0; actions still run once");
    }
    if retry.max_delay_ms < retry.initial_delay_ms {
        return CheckResult::issue(
            label,
            format!(
                "max_delay_ms {} is below initial_delay_ms {}",
                retry.max_delay_ms, retry.initial_delay_ms
            ),
        );
    }
    CheckResult::ok(
        label,
        format!(
            "{} attempts, {}ms x{} up to {}ms",
            retry.max_attempts, retry.initial_delay_ms, retry.multiplier, retry.max_delay_ms
        ),
    )
}
