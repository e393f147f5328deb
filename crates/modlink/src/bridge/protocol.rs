//! Wire message types for bridge-helper communication.
//!
//! A request travels as three newline-terminated JSON values (request
//! id, command id, argument record); a reply travels as three (request
//! id, result value, status). The startup handshake is the single
//! exception: two lines, no request id.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Pseudo-command answered from the retained handshake, never written
/// to the pipe.
pub const CMD_INIT: &str = "_init";

/// Pseudo-command that shuts the worker down; acknowledged client-side,
/// never written to the pipe.
pub const CMD_DIE: &str = "_die";

/// Handshake status value for a normally started helper.
pub const HANDSHAKE_OK: &str = "ok";

/// Handshake status value for a helper started with `--debug`.
pub const HANDSHAKE_DEBUG: &str = "debug";

/// One remote call: a unique id, a command name, and positional args.
#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    pub request_id: String,
    pub command: String,
    pub args: Vec<Value>,
}

impl Request {
    pub fn new(request_id: impl Into<String>, command: impl Into<String>, args: Vec<Value>) -> Self {
        Self {
            request_id: request_id.into(),
            command: command.into(),
            args,
        }
    }
}

/// Non-null status marks the call as failed; `value` is meaningless then.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplyStatus {
    pub error: String,
}

/// Result of one remote call, correlated by `request_id`.
///
/// `request_id` is `None` only for the startup handshake.
#[derive(Debug, Clone, PartialEq)]
pub struct Reply {
    pub request_id: Option<String>,
    pub value: Value,
    pub status: Option<ReplyStatus>,
}

impl Reply {
    pub fn ok(request_id: impl Into<String>, value: Value) -> Self {
        Self {
            request_id: Some(request_id.into()),
            value,
            status: None,
        }
    }

    pub fn error(request_id: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            request_id: Some(request_id.into()),
            value: Value::Null,
            status: Some(ReplyStatus {
                error: error.into(),
            }),
        }
    }

    pub fn handshake(status: impl Into<String>) -> Self {
        Self {
            request_id: None,
            value: Value::String(status.into()),
            status: None,
        }
    }

    pub fn is_error(&self) -> bool {
        self.status.is_some()
    }

    /// Re-stamp a retained handshake with the id of an `_init` caller.
    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }
}

/// Re-shape positional arguments into the named-tuple-like record the
/// helper's deserializer expects: `{"Item1": args[0], ..., "ItemN": args[n-1]}`.
pub fn pack_args(args: &[Value]) -> Value {
    let mut map = serde_json::Map::with_capacity(args.len());
    for (i, arg) in args.iter().enumerate() {
        map.insert(format!("Item{}", i + 1), arg.clone());
    }
    Value::Object(map)
}

/// Reconstruct positional arguments from an `Item1..ItemN` record.
///
/// Order comes from the key index, not map iteration order.
pub fn unpack_args(value: &Value) -> Result<Vec<Value>, String> {
    let map = value
        .as_object()
        .ok_or_else(|| format!("argument payload must be an object, got {}", value))?;

    let mut args = Vec::with_capacity(map.len());
    for i in 1..=map.len() {
        let key = format!("Item{}", i);
        let arg = map
            .get(&key)
            .ok_or_else(|| format!("argument payload is missing key {:?}", key))?;
        args.push(arg.clone());
    }
    Ok(args)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn args_roundtrip_preserves_order() {
        let args = vec![json!("first"), json!(2), json!({"nested": true}), json!(null)];
        let packed = pack_args(&args);

        assert_eq!(
            packed,
            json!({"Item1": "first", "Item2": 2, "Item3": {"nested": true}, "Item4": null})
        );
        assert_eq!(unpack_args(&packed).unwrap(), args);
    }

    #[test]
    fn empty_args_pack_to_empty_object() {
        let packed = pack_args(&[]);
        assert_eq!(packed, json!({}));
        assert_eq!(unpack_args(&packed).unwrap(), Vec::<Value>::new());
    }

    #[test]
    fn unpack_rejects_non_object() {
        let err = unpack_args(&json!(["positional"])).unwrap_err();
        assert!(err.contains("must be an object"));
    }

    #[test]
    fn unpack_rejects_gap_in_keys() {
        let err = unpack_args(&json!({"Item1": 1, "Item3": 3})).unwrap_err();
        assert!(err.contains("Item2"));
    }

    #[test]
    fn status_serializes_as_error_object() {
        let status = Some(ReplyStatus {
            error: "boom".to_string(),
        });
        assert_eq!(serde_json::to_value(&status).unwrap(), json!({"error": "boom"}));

        let none: Option<ReplyStatus> = None;
        assert_eq!(serde_json::to_value(&none).unwrap(), Value::Null);

        let parsed: Option<ReplyStatus> = serde_json::from_value(json!({"error": "x"})).unwrap();
        assert_eq!(parsed.unwrap().error, "x");
    }

    #[test]
    fn handshake_restamped_for_init_caller() {
        let handshake = Reply::handshake(HANDSHAKE_OK);
        assert_eq!(handshake.request_id, None);

        let stamped = handshake.with_request_id("ctx-1");
        assert_eq!(stamped.request_id.as_deref(), Some("ctx-1"));
        assert_eq!(stamped.value, json!("ok"));
        assert!(!stamped.is_error());
    }
}
