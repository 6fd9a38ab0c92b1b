// Copyright (c) Meta Platforms, Inc. and affiliates.
//
// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! JSON-RPC 2.0 framing and the parameters of the session methods.

use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;

use crate::affinity::AffinityLocation;
use crate::backend::PdId;
use crate::backend::SignalHandler;
use crate::backend::ThreadCap;
use crate::backend::Weight;
use crate::session::SessionId;

pub const PARSE_ERROR: i64 = -32700;
pub const METHOD_NOT_FOUND: i64 = -32601;
pub const INVALID_PARAMS: i64 = -32602;
pub const SERVICE_ERROR: i64 = -32000;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: String,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcResponse {
    pub jsonrpc: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
    pub id: Option<Value>,
}

impl JsonRpcResponse {
    pub fn success(id: Option<Value>, result: Value) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            result: Some(result),
            error: None,
            id,
        }
    }

    pub fn failure(id: Option<Value>, error: JsonRpcError) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            result: None,
            error: Some(error),
            id,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcError {
    pub code: i64,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl JsonRpcError {
    fn new(code: i64, message: String) -> Self {
        Self {
            code,
            message,
            data: None,
        }
    }

    pub fn parse_error() -> Self {
        Self::new(PARSE_ERROR, "Parse error".to_string())
    }

    pub fn method_not_found(method: &str) -> Self {
        Self::new(METHOD_NOT_FOUND, format!("Method not found: {}", method))
    }

    pub fn invalid_params(msg: &str) -> Self {
        Self::new(INVALID_PARAMS, format!("Invalid params: {}", msg))
    }

    pub fn service_error(msg: &str) -> Self {
        Self::new(SERVICE_ERROR, msg.to_string())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SessionParams {
    pub session: SessionId,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UpgradeParams {
    pub session: SessionId,
    #[serde(default)]
    pub ram: u64,
    #[serde(default)]
    pub caps: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreateThreadParams {
    pub session: SessionId,
    pub pd: PdId,
    pub name: String,
    /// Relative to the session's window.
    #[serde(default)]
    pub location: AffinityLocation,
    #[serde(default)]
    pub weight: Weight,
    #[serde(default)]
    pub utcb: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct KillThreadParams {
    pub session: SessionId,
    pub thread: ThreadCap,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExceptionSighParams {
    pub session: SessionId,
    pub handler: SignalHandler,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RefAccountParams {
    pub session: SessionId,
    pub account: SessionId,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TransferQuotaParams {
    pub session: SessionId,
    pub to: SessionId,
    pub amount: u64,
}
