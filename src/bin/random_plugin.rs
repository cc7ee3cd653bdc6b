//! Reference provider plugin: random identifiers
//!
//! Speaks the engine's plugin protocol on stdio: one JSON request per line
//! in, one JSON response per line out, correlated by `id`. Resources are
//! random tokens; inputs are immutable, so any input change diffs as a
//! replacement.

use std::io::{self, BufRead, Write};

use rand::Rng;
use serde_json::{json, Value};

fn main() -> io::Result<()> {
    let stdin = io::stdin();
    let stdout = io::stdout();
    let mut out = stdout.lock();

    for line in stdin.lock().lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let request: Value = match serde_json::from_str(&line) {
            Ok(v) => v,
            Err(e) => {
                eprintln!("trellis-random-plugin: discarding malformed request: {e}");
                continue;
            }
        };
        let Some(id) = request.get("id").and_then(Value::as_u64) else {
            eprintln!("trellis-random-plugin: request without id");
            continue;
        };
        let response = handle(&request, id);
        serde_json::to_writer(&mut out, &response)?;
        out.write_all(b"\n")?;
        out.flush()?;
    }
    Ok(())
}

fn handle(request: &Value, id: u64) -> Value {
    let op = request.get("op").and_then(Value::as_str).unwrap_or("");
    match op {
        "diff" => {
            let prior = request.get("prior").cloned().unwrap_or(Value::Null);
            let desired = request.get("desired").cloned().unwrap_or(Value::Null);
            let changed = changed_paths(&prior, &desired);
            // Random tokens cannot be rewritten in place
            let requires_replace = !changed.is_empty();
            json!({
                "id": id,
                "ok": {
                    "changedPaths": changed,
                    "requiresReplace": requires_replace,
                }
            })
        }
        "create" => {
            let inputs = request.get("inputs").cloned().unwrap_or(Value::Null);
            let length = inputs
                .get("length")
                .and_then(Value::as_u64)
                .unwrap_or(8)
                .min(64) as usize;
            if length == 0 {
                return error(id, "rejected", "length must be greater than zero");
            }
            let token: String = {
                let mut rng = rand::thread_rng();
                (0..length)
                    .map(|_| format!("{:x}", rng.gen_range(0u8..16)))
                    .collect()
            };
            let prefix = inputs
                .get("prefix")
                .and_then(Value::as_str)
                .unwrap_or("rnd");
            json!({
                "id": id,
                "ok": {
                    "id": format!("{prefix}-{token}"),
                    "token": token,
                    "length": length,
                }
            })
        }
        "update" => error(
            id,
            "rejected",
            "random resources are immutable; replace instead",
        ),
        "delete" => json!({ "id": id, "ok": null }),
        other => error(id, "rejected", &format!("unsupported op {other:?}")),
    }
}

fn changed_paths(prior: &Value, desired: &Value) -> Vec<String> {
    match (prior, desired) {
        (Value::Object(p), Value::Object(d)) => {
            let mut paths: Vec<String> = Vec::new();
            for key in p.keys().chain(d.keys()) {
                if p.get(key) != d.get(key) && !paths.contains(key) {
                    paths.push(key.clone());
                }
            }
            paths
        }
        (p, d) if p == d => Vec::new(),
        _ => vec![".".to_string()],
    }
}

fn error(id: u64, kind: &str, message: &str) -> Value {
    json!({
        "id": id,
        "error": { "kind": kind, "message": message }
    })
}
