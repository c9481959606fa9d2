//! JSON-RPC 2.0 envelopes
//!
//! Requests carry a namespaced `method` whose value decides the shape of
//! `params`; responses carry either `result` or `error`. The `id` is the
//! correlation key for the whole system.

use serde::de::Error as _;
use serde::ser::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;
use std::fmt;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::types::{
    DeleteParams, PairingApproveParams, PairingPayloadParams, PingParams, SessionApproveParams,
    SessionPayloadParams, SessionRejectParams, SessionUpdateParams, SessionUpgradeParams,
};

/// Protocol version string
pub const JSONRPC_VERSION: &str = "2.0";

/// Next request id: millisecond clock scaled by 1000, strictly increasing
/// within the process.
pub fn next_id() -> i64 {
    static LAST: AtomicI64 = AtomicI64::new(0);

    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0);
    let candidate = millis * 1000;

    let previous = LAST
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |last| {
            Some(candidate.max(last + 1))
        })
        .unwrap_or(candidate);
    candidate.max(previous + 1)
}

/// A generic JSON-RPC request
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcRequest<T> {
    /// Correlation id
    pub id: i64,
    /// Always `2.0`
    pub jsonrpc: String,
    /// Method name
    pub method: String,
    /// Method params
    pub params: T,
}

/// A successful JSON-RPC response
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcResponse {
    /// Id of the request this answers
    pub id: i64,
    /// Always `2.0`
    pub jsonrpc: String,
    /// Result value
    pub result: Value,
}

impl JsonRpcResponse {
    /// Response with an arbitrary result
    pub fn new(id: i64, result: Value) -> Self {
        JsonRpcResponse {
            id,
            jsonrpc: JSONRPC_VERSION.to_string(),
            result,
        }
    }

    /// `{"result": true}` acknowledgement
    pub fn ack(id: i64) -> Self {
        Self::new(id, Value::Bool(true))
    }
}

/// Error object of a JSON-RPC error response
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct JsonRpcError {
    /// Error code
    pub code: i64,
    /// Error message
    pub message: String,
}

impl fmt::Display for JsonRpcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (code {})", self.message, self.code)
    }
}

/// A failed JSON-RPC response
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct JsonRpcErrorResponse {
    /// Id of the request this answers
    pub id: i64,
    /// Always `2.0`
    pub jsonrpc: String,
    /// Error details
    pub error: JsonRpcError,
}

impl JsonRpcErrorResponse {
    /// Error response for request `id`
    pub fn new(id: i64, code: i64, message: impl Into<String>) -> Self {
        JsonRpcErrorResponse {
            id,
            jsonrpc: JSONRPC_VERSION.to_string(),
            error: JsonRpcError {
                code,
                message: message.into(),
            },
        }
    }
}

/// Either kind of response
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(untagged)]
pub enum RpcResponse {
    /// `result` response
    Success(JsonRpcResponse),
    /// `error` response
    Error(JsonRpcErrorResponse),
}

impl RpcResponse {
    /// Id of the request this answers
    pub fn id(&self) -> i64 {
        match self {
            RpcResponse::Success(response) => response.id,
            RpcResponse::Error(response) => response.id,
        }
    }
}

impl From<JsonRpcResponse> for RpcResponse {
    fn from(response: JsonRpcResponse) -> Self {
        RpcResponse::Success(response)
    }
}

impl From<JsonRpcErrorResponse> for RpcResponse {
    fn from(response: JsonRpcErrorResponse) -> Self {
        RpcResponse::Error(response)
    }
}

/// Protocol methods
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[allow(missing_docs)]
pub enum WcMethod {
    PairingApprove,
    PairingDelete,
    PairingPayload,
    PairingPing,
    SessionPropose,
    SessionApprove,
    SessionReject,
    SessionUpdate,
    SessionUpgrade,
    SessionDelete,
    SessionPayload,
    SessionPing,
}

impl WcMethod {
    /// Wire name
    pub fn as_str(&self) -> &'static str {
        match self {
            WcMethod::PairingApprove => "wc_pairingApprove",
            WcMethod::PairingDelete => "wc_pairingDelete",
            WcMethod::PairingPayload => "wc_pairingPayload",
            WcMethod::PairingPing => "wc_pairingPing",
            WcMethod::SessionPropose => "wc_sessionPropose",
            WcMethod::SessionApprove => "wc_sessionApprove",
            WcMethod::SessionReject => "wc_sessionReject",
            WcMethod::SessionUpdate => "wc_sessionUpdate",
            WcMethod::SessionUpgrade => "wc_sessionUpgrade",
            WcMethod::SessionDelete => "wc_sessionDelete",
            WcMethod::SessionPayload => "wc_sessionPayload",
            WcMethod::SessionPing => "wc_sessionPing",
        }
    }
}

impl fmt::Display for WcMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Params of every request this engine exchanges, keyed by method
#[derive(Clone, Debug, PartialEq)]
#[allow(missing_docs)]
pub enum WcParams {
    PairingApprove(PairingApproveParams),
    PairingDelete(DeleteParams),
    PairingPayload(PairingPayloadParams),
    PairingPing(PingParams),
    SessionApprove(SessionApproveParams),
    SessionReject(SessionRejectParams),
    SessionUpdate(SessionUpdateParams),
    SessionUpgrade(SessionUpgradeParams),
    SessionDelete(DeleteParams),
    SessionPayload(SessionPayloadParams),
    SessionPing(PingParams),
}

impl WcParams {
    /// Method these params belong to
    pub fn method(&self) -> WcMethod {
        match self {
            WcParams::PairingApprove(_) => WcMethod::PairingApprove,
            WcParams::PairingDelete(_) => WcMethod::PairingDelete,
            WcParams::PairingPayload(_) => WcMethod::PairingPayload,
            WcParams::PairingPing(_) => WcMethod::PairingPing,
            WcParams::SessionApprove(_) => WcMethod::SessionApprove,
            WcParams::SessionReject(_) => WcMethod::SessionReject,
            WcParams::SessionUpdate(_) => WcMethod::SessionUpdate,
            WcParams::SessionUpgrade(_) => WcMethod::SessionUpgrade,
            WcParams::SessionDelete(_) => WcMethod::SessionDelete,
            WcParams::SessionPayload(_) => WcMethod::SessionPayload,
            WcParams::SessionPing(_) => WcMethod::SessionPing,
        }
    }

    fn to_value(&self) -> serde_json::Result<Value> {
        match self {
            WcParams::PairingApprove(p) => serde_json::to_value(p),
            WcParams::PairingDelete(p) | WcParams::SessionDelete(p) => serde_json::to_value(p),
            WcParams::PairingPayload(p) => serde_json::to_value(p),
            WcParams::PairingPing(p) | WcParams::SessionPing(p) => serde_json::to_value(p),
            WcParams::SessionApprove(p) => serde_json::to_value(p),
            WcParams::SessionReject(p) => serde_json::to_value(p),
            WcParams::SessionUpdate(p) => serde_json::to_value(p),
            WcParams::SessionUpgrade(p) => serde_json::to_value(p),
            WcParams::SessionPayload(p) => serde_json::to_value(p),
        }
    }

    fn from_value(method: &str, params: Value) -> Result<Self, String> {
        let decoded = match method {
            "wc_pairingApprove" => serde_json::from_value(params).map(WcParams::PairingApprove),
            "wc_pairingDelete" => serde_json::from_value(params).map(WcParams::PairingDelete),
            "wc_pairingPayload" => serde_json::from_value(params).map(WcParams::PairingPayload),
            "wc_pairingPing" => serde_json::from_value(params).map(WcParams::PairingPing),
            "wc_sessionApprove" => serde_json::from_value(params).map(WcParams::SessionApprove),
            "wc_sessionReject" => serde_json::from_value(params).map(WcParams::SessionReject),
            "wc_sessionUpdate" => serde_json::from_value(params).map(WcParams::SessionUpdate),
            "wc_sessionUpgrade" => serde_json::from_value(params).map(WcParams::SessionUpgrade),
            "wc_sessionDelete" => serde_json::from_value(params).map(WcParams::SessionDelete),
            "wc_sessionPayload" => serde_json::from_value(params).map(WcParams::SessionPayload),
            "wc_sessionPing" => serde_json::from_value(params).map(WcParams::SessionPing),
            other => return Err(format!("unknown method {other}")),
        };
        decoded.map_err(|e| format!("invalid params for {method}: {e}"))
    }
}

/// A protocol request
#[derive(Clone, Debug, PartialEq)]
pub struct WcRequest {
    /// Correlation id
    pub id: i64,
    /// Always `2.0`
    pub jsonrpc: String,
    /// Method-specific params
    pub params: WcParams,
}

impl WcRequest {
    /// New request with a fresh id
    pub fn new(params: WcParams) -> Self {
        WcRequest {
            id: next_id(),
            jsonrpc: JSONRPC_VERSION.to_string(),
            params,
        }
    }

    /// Method of this request
    pub fn method(&self) -> WcMethod {
        self.params.method()
    }
}

impl Serialize for WcRequest {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let params = self.params.to_value().map_err(S::Error::custom)?;
        JsonRpcRequest {
            id: self.id,
            jsonrpc: self.jsonrpc.clone(),
            method: self.method().as_str().to_string(),
            params,
        }
        .serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for WcRequest {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = JsonRpcRequest::<Value>::deserialize(deserializer)?;
        let params = WcParams::from_value(&raw.method, raw.params).map_err(D::Error::custom)?;
        Ok(WcRequest {
            id: raw.id,
            jsonrpc: raw.jsonrpc,
            params,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Reason;

    #[test]
    fn test_ids_strictly_increase() {
        let mut last = next_id();
        for _ in 0..10_000 {
            let id = next_id();
            assert!(id > last);
            last = id;
        }
    }

    #[test]
    fn test_request_wire_shape() {
        let request = WcRequest {
            id: 7,
            jsonrpc: JSONRPC_VERSION.to_string(),
            params: WcParams::SessionDelete(DeleteParams {
                reason: Reason::new(6000, "User disconnected"),
            }),
        };

        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "id": 7,
                "jsonrpc": "2.0",
                "method": "wc_sessionDelete",
                "params": { "reason": { "code": 6000, "message": "User disconnected" } }
            })
        );

        let restored: WcRequest = serde_json::from_value(json).unwrap();
        assert_eq!(restored, request);
    }

    #[test]
    fn test_unknown_method_rejected() {
        let json = r#"{"id":1,"jsonrpc":"2.0","method":"wc_sessionNotification","params":{}}"#;
        assert!(serde_json::from_str::<WcRequest>(json).is_err());
    }

    #[test]
    fn test_mismatched_params_rejected() {
        let json = r#"{"id":1,"jsonrpc":"2.0","method":"wc_sessionReject","params":{}}"#;
        assert!(serde_json::from_str::<WcRequest>(json).is_err());
    }

    #[test]
    fn test_response_requires_result() {
        let error = r#"{"id":1,"jsonrpc":"2.0","error":{"code":3001,"message":"nope"}}"#;
        assert!(serde_json::from_str::<JsonRpcResponse>(error).is_err());
        assert!(serde_json::from_str::<JsonRpcErrorResponse>(error).is_ok());
    }

    #[test]
    fn test_rpc_response_serializes_untagged() {
        let response: RpcResponse = JsonRpcErrorResponse::new(3, 3001, "nope").into();
        let json = serde_json::to_value(&response).unwrap();
        assert_eq!(json["error"]["code"], 3001);
        assert_eq!(response.id(), 3);
    }
}
