/*============================================================
  Synavera Project: Syn-Pkg
  Module: synpkg_core::rpc
  Etiquette: Synavera Script Etiquette — Rust Profile v1.1.1
  ------------------------------------------------------------
  Purpose:
    JSON-RPC 2.0 envelope types, the shared parameter object,
    and the method table that routes calls to registered
    handlers.

  Security / Safety Notes:
    Parameter decoding is strict about shape (object or
    absent); unknown members are ignored. Handler failures are
    reported as status codes, never as internal detail.

  Dependencies:
    serde / serde_json for envelopes and parameters.

  Operational Scope:
    Populated by the plugin facade; driven by the stdio loop
    and the one-shot `call` command.

  Revision History:
    2026-10-17 COD  Authored JSON-RPC method table.
  ------------------------------------------------------------
  SSE Principles Observed:
    - Stable method names on the wire
    - Explicit error codes for every rejection path
============================================================*/

use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, PoisonError, RwLock};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::packager::{PackagerResult, Status};

pub const INSTALL_METHOD: &str = "install";
pub const SYNCHRONIZE_METHOD: &str = "synchronize";
pub const REMOVE_METHOD: &str = "remove";
pub const CANCEL_METHOD: &str = "cancel";
pub const IS_INSTALLED_METHOD: &str = "isInstalled";
pub const GET_INSTALL_PROGRESS_METHOD: &str = "getInstallProgress";
pub const GET_INSTALLED_METHOD: &str = "getInstalled";
pub const GET_PACKAGE_INFO_METHOD: &str = "getPackageInfo";
pub const GET_AVAILABLE_SPACE_METHOD: &str = "getPackageAvailableSpace";

/// Every method the facade exposes.
pub const ALL_METHODS: [&str; 9] = [
    INSTALL_METHOD,
    SYNCHRONIZE_METHOD,
    REMOVE_METHOD,
    CANCEL_METHOD,
    IS_INSTALLED_METHOD,
    GET_INSTALL_PROGRESS_METHOD,
    GET_INSTALLED_METHOD,
    GET_PACKAGE_INFO_METHOD,
    GET_AVAILABLE_SPACE_METHOD,
];

const JSONRPC_VERSION: &str = "2.0";

/// Parameter object shared by all methods. Absent members read as empty.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Params {
    pub package: String,
    pub architecture: String,
    pub version: String,
    pub id: String,
    pub app_id: String,
    pub task: String,
    pub listener: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub url: String,
    pub token: String,
}

/// Incoming call or notification.
#[derive(Debug, Clone, Deserialize)]
pub struct RpcRequest {
    #[serde(default)]
    pub jsonrpc: String,
    #[serde(default)]
    pub id: Option<Value>,
    pub method: String,
    #[serde(default)]
    pub params: Option<Value>,
}

impl RpcRequest {
    pub fn new(id: impl Into<Value>, method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id: Some(id.into()),
            method: method.into(),
            params,
        }
    }
}

/// Error member of a response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcError {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl RpcError {
    pub const PARSE_ERROR: i64 = -32700;
    pub const INVALID_REQUEST: i64 = -32600;
    pub const METHOD_NOT_FOUND: i64 = -32601;
    pub const INVALID_PARAMS: i64 = -32602;

    fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }

    pub fn parse_error(message: impl Into<String>) -> Self {
        Self::new(Self::PARSE_ERROR, message)
    }

    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::new(Self::INVALID_REQUEST, message)
    }

    pub fn method_not_found(method: &str) -> Self {
        Self::new(Self::METHOD_NOT_FOUND, format!("Unknown method `{method}`"))
    }

    pub fn invalid_params(message: impl Into<String>) -> Self {
        Self::new(Self::INVALID_PARAMS, message)
    }

    /// Packager statuses travel with their numeric code.
    pub fn from_status(status: Status) -> Self {
        Self::new(i64::from(status.code()), status.name())
    }
}

/// Outgoing reply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcResponse {
    pub jsonrpc: String,
    pub id: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
}

impl RpcResponse {
    pub fn success(id: Value, result: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            result: Some(result),
            error: None,
        }
    }

    pub fn failure(id: Value, error: RpcError) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            result: None,
            error: Some(error),
        }
    }
}

type HandlerFuture = Pin<Box<dyn Future<Output = PackagerResult<Value>> + Send>>;
type Handler = Arc<dyn Fn(Params) -> HandlerFuture + Send + Sync>;

/// Method table mapping names to handlers.
#[derive(Default)]
pub struct Dispatcher {
    methods: RwLock<BTreeMap<String, Handler>>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` under `name`, replacing any previous entry.
    pub fn register<F, Fut>(&self, name: &str, handler: F)
    where
        F: Fn(Params) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = PackagerResult<Value>> + Send + 'static,
    {
        let handler: Handler = Arc::new(move |params| Box::pin(handler(params)));
        self.methods
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name.to_string(), handler);
    }

    /// Returns whether a handler was registered under `name`.
    pub fn unregister(&self, name: &str) -> bool {
        self.methods
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(name)
            .is_some()
    }

    pub fn is_registered(&self, name: &str) -> bool {
        self.methods
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(name)
    }

    /// Registered method names in sorted order.
    pub fn methods(&self) -> Vec<String> {
        self.methods
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect()
    }

    /// Route one request. Notifications (no `id`) yield no response.
    pub async fn dispatch(&self, request: RpcRequest) -> Option<RpcResponse> {
        let outcome = self.invoke(&request).await;
        let id = request.id?;
        Some(match outcome {
            Ok(result) => RpcResponse::success(id, result),
            Err(error) => RpcResponse::failure(id, error),
        })
    }

    /// Route one raw line from a byte stream; text that is not UTF-8 is a parse error.
    pub async fn dispatch_bytes(&self, line: &[u8]) -> Option<String> {
        match std::str::from_utf8(line) {
            Ok(text) => self.dispatch_line(text).await,
            Err(err) => serde_json::to_string(&RpcResponse::failure(
                Value::Null,
                RpcError::parse_error(format!("Request is not UTF-8: {err}")),
            ))
            .ok(),
        }
    }

    /// Route one encoded request line and encode the reply.
    pub async fn dispatch_line(&self, line: &str) -> Option<String> {
        let response = match serde_json::from_str::<Value>(line) {
            Err(err) => Some(RpcResponse::failure(
                Value::Null,
                RpcError::parse_error(format!("Invalid JSON: {err}")),
            )),
            Ok(value) if !value.is_object() => Some(RpcResponse::failure(
                Value::Null,
                RpcError::invalid_request("Request must be a JSON object"),
            )),
            Ok(value) => {
                let id = value.get("id").cloned().unwrap_or(Value::Null);
                match serde_json::from_value::<RpcRequest>(value) {
                    Ok(request) => self.dispatch(request).await,
                    Err(err) => Some(RpcResponse::failure(
                        id,
                        RpcError::invalid_request(format!("Malformed request: {err}")),
                    )),
                }
            }
        }?;
        serde_json::to_string(&response).ok()
    }

    async fn invoke(&self, request: &RpcRequest) -> Result<Value, RpcError> {
        if request.jsonrpc != JSONRPC_VERSION {
            return Err(RpcError::invalid_request(format!(
                "Unsupported jsonrpc version `{}`",
                request.jsonrpc
            )));
        }
        let params = decode_params(request.params.as_ref())?;
        let handler = self
            .methods
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&request.method)
            .cloned()
            .ok_or_else(|| RpcError::method_not_found(&request.method))?;
        handler(params).await.map_err(RpcError::from_status)
    }
}

fn decode_params(params: Option<&Value>) -> Result<Params, RpcError> {
    match params {
        None | Some(Value::Null) => Ok(Params::default()),
        Some(value @ Value::Object(_)) => serde_json::from_value(value.clone())
            .map_err(|err| RpcError::invalid_params(format!("Invalid parameters: {err}"))),
        Some(_) => Err(RpcError::invalid_params("Parameters must be a JSON object")),
    }
}
