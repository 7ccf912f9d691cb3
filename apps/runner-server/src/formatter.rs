use serde_json::{Map, Value};

use crate::models::AgentType;

/// Turn an agent's raw JSON output into the short summary stored as the
/// node's `result` and handed to the next node.
///
/// Returns `raw` unchanged when it is not a JSON object or carries none of
/// the fields this agent type is expected to produce.
pub fn format_node_result(agent_type: AgentType, raw: &str) -> String {
    let parsed: Value = match serde_json::from_str(raw) {
        Ok(v) => v,
        Err(_) => return raw.to_string(),
    };
    let obj = match parsed.as_object() {
        Some(o) => o,
        None => return raw.to_string(),
    };

    let mut lines: Vec<String> = Vec::new();
    match agent_type {
        AgentType::Researcher => {
            push(&mut lines, text(obj, "summary"));
            push(&mut lines, list(obj, "trends", ", ").map(|t| format!("Trends: {}", t)));
        }
        AgentType::Strategist => {
            push(&mut lines, text(obj, "angle"));
            push(&mut lines, text(obj, "audience").map(|a| format!("Audience: {}", a)));
        }
        AgentType::Writer => {
            push(&mut lines, text(obj, "caption"));
            push(&mut lines, hashtags(obj));
        }
        AgentType::MediaCreator => {
            push(&mut lines, text(obj, "imagePrompt").map(|p| format!("Image: {}", p)));
            push(&mut lines, text(obj, "style").map(|s| format!("Style: {}", s)));
        }
        AgentType::Editor => {
            push(
                &mut lines,
                field(obj, "approved")
                    .and_then(Value::as_bool)
                    .map(|ok| (if ok { "Approved" } else { "Changes requested" }).to_string()),
            );
            push(&mut lines, text(obj, "feedback"));
        }
        AgentType::Scheduler => {
            push(&mut lines, text(obj, "scheduledTime").map(|t| format!("Scheduled for {}", t)));
            push(&mut lines, text(obj, "reasoning"));
        }
        AgentType::Publisher => {
            let platform = text(obj, "platform");
            let status = text(obj, "status");
            push(
                &mut lines,
                match (platform, status) {
                    (Some(p), Some(s)) => Some(format!("{}: {}", p, s)),
                    (Some(p), None) => Some(p),
                    (None, Some(s)) => Some(s),
                    (None, None) => None,
                },
            );
            push(&mut lines, text(obj, "postUrl"));
        }
        AgentType::Analyst => {
            push(&mut lines, list(obj, "insights", "; "));
            push(&mut lines, text(obj, "recommendation"));
        }
    }

    if lines.is_empty() {
        raw.to_string()
    } else {
        lines.join("\n")
    }
}

fn push(lines: &mut Vec<String>, line: Option<String>) {
    if let Some(line) = line {
        lines.push(line);
    }
}

/// Looks up a camelCase key, falling back to its snake_case spelling.
fn field<'a>(obj: &'a Map<String, Value>, key: &str) -> Option<&'a Value> {
    obj.get(key).or_else(|| obj.get(&to_snake_case(key)))
}

fn text(obj: &Map<String, Value>, key: &str) -> Option<String> {
    match field(obj, key)? {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn list(obj: &Map<String, Value>, key: &str, sep: &str) -> Option<String> {
    let items: Vec<&str> = field(obj, key)?
        .as_array()?
        .iter()
        .filter_map(Value::as_str)
        .collect();
    if items.is_empty() {
        None
    } else {
        Some(items.join(sep))
    }
}

fn hashtags(obj: &Map<String, Value>) -> Option<String> {
    let tags: Vec<String> = field(obj, "hashtags")?
        .as_array()?
        .iter()
        .filter_map(Value::as_str)
        .map(|t| {
            if t.starts_with('#') {
                t.to_string()
            } else {
                format!("#{}", t)
            }
        })
        .collect();
    if tags.is_empty() {
        None
    } else {
        Some(tags.join(" "))
    }
}

fn to_snake_case(key: &str) -> String {
    let mut out = String::with_capacity(key.len() + 4);
    for c in key.chars() {
        if c.is_ascii_uppercase() {
            out.push('_');
            out.push(c.to_ascii_lowercase());
        } else {
            out.push(c);
        }
    }
    out
}
