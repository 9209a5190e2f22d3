use serde_json::{Map, Value};

use crate::error::{LinkError, LinkResult};

pub const PING: &str = "PING";
pub const GET_TREE: &str = "GET_TREE";
pub const LOAD_TAGS: &str = "LOAD_TAGS";
pub const LOAD_GRAPH: &str = "LOAD_GRAPH";

/// Issued in order right after a local login so the UI has something to show.
pub const BOOTSTRAP_COMMANDS: [&str; 3] = [GET_TREE, LOAD_TAGS, LOAD_GRAPH];

pub const REQUEST_ID_FIELD: &str = "requestId";

/// Builds `{cmd, ...extra}`. `extra` must be a JSON object or null; its keys
/// win over `cmd`, the same as a JS object spread.
pub fn command_body(cmd: &str, extra: Value) -> LinkResult<Map<String, Value>> {
    let mut body = Map::new();
    body.insert("cmd".into(), Value::String(cmd.to_string()));
    match extra {
        Value::Null => {}
        Value::Object(fields) => body.extend(fields),
        other => {
            return Err(LinkError::Transport(format!(
                "command payload for {cmd} must be a JSON object, got {other}"
            )))
        }
    }
    Ok(body)
}

/// The command name a reply answers to: its `cmd`, or failing that its `type`.
pub fn reply_tags(message: &Value) -> (Option<&str>, Option<&str>) {
    (
        message.get("cmd").and_then(Value::as_str),
        message.get("type").and_then(Value::as_str),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn merges_extra_fields() {
        let body = command_body("LOAD_FILE", json!({"path": "notes/a.md"})).unwrap();
        assert_eq!(
            Value::Object(body),
            json!({"cmd": "LOAD_FILE", "path": "notes/a.md"})
        );
    }

    #[test]
    fn null_extra_is_empty() {
        let body = command_body(PING, Value::Null).unwrap();
        assert_eq!(Value::Object(body), json!({"cmd": "PING"}));
    }

    #[test]
    fn rejects_non_object_extra() {
        assert!(command_body(PING, json!([1, 2])).is_err());
    }
}
