//! Line-JSON message types for the stratum subprotocol.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

pub const AGENT: &str = concat!("stope-miner/", env!("CARGO_PKG_VERSION"));

#[derive(Debug, Clone, Serialize)]
pub struct RpcRequest {
    pub id: u64,
    pub method: String,
    pub params: Value,
}

impl RpcRequest {
    pub fn subscribe(id: u64, session: Option<&str>) -> Self {
        let params = match session {
            Some(session) => json!([AGENT, session]),
            None => json!([AGENT]),
        };
        Self {
            id,
            method: "mining.subscribe".into(),
            params,
        }
    }

    pub fn authorize(id: u64, user: &str, pass: &str) -> Self {
        Self {
            id,
            method: "mining.authorize".into(),
            params: json!([user, pass]),
        }
    }

    pub fn submit(
        id: u64,
        worker: &str,
        job_id: &str,
        nonce2_hex: &str,
        ntime_hex: &str,
        nonce_hex: &str,
    ) -> Self {
        Self {
            id,
            method: "mining.submit".into(),
            params: json!([worker, job_id, nonce2_hex, ntime_hex, nonce_hex]),
        }
    }

    pub fn suggest_difficulty(id: u64, diff: f64) -> Self {
        Self {
            id,
            method: "mining.suggest_difficulty".into(),
            params: json!([diff]),
        }
    }
}

/// Anything the pool sends: responses carry `id`/`result`, notifications
/// carry `method`/`params`.
#[derive(Debug, Clone, Deserialize)]
pub struct RpcMessage {
    #[serde(default)]
    pub id: Option<u64>,
    #[serde(default)]
    pub method: Option<String>,
    #[serde(default)]
    pub params: Option<Value>,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<Value>,
}

impl RpcMessage {
    pub fn error_text(&self) -> Option<String> {
        let err = self.error.as_ref()?;
        if err.is_null() {
            return None;
        }
        // Errors arrive either as [code, "message", data] or as an object.
        if let Some(arr) = err.as_array() {
            let msg = arr.get(1).and_then(Value::as_str).unwrap_or("unknown");
            return Some(msg.to_string());
        }
        if let Some(obj) = err.as_object() {
            let msg = obj.get("message").and_then(Value::as_str).unwrap_or("unknown");
            return Some(msg.to_string());
        }
        Some(err.to_string())
    }

    pub fn result_bool(&self) -> bool {
        matches!(self.result.as_ref().and_then(Value::as_bool), Some(true))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn submit_params_shape() {
        let req = RpcRequest::submit(9, "u", "abc", "", "504e86b9", "12345678");
        let line = serde_json::to_string(&req).unwrap();
        let v: Value = serde_json::from_str(&line).unwrap();
        assert_eq!(v["method"], "mining.submit");
        assert_eq!(v["params"], json!(["u", "abc", "", "504e86b9", "12345678"]));
    }

    #[test]
    fn error_shapes() {
        let m: RpcMessage =
            serde_json::from_str(r#"{"id":1,"result":null,"error":[21,"Job not found",null]}"#)
                .unwrap();
        assert_eq!(m.error_text().as_deref(), Some("Job not found"));

        let m: RpcMessage =
            serde_json::from_str(r#"{"id":1,"result":true,"error":null}"#).unwrap();
        assert!(m.error_text().is_none());
        assert!(m.result_bool());
    }
}
