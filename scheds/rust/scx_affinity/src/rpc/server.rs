// Copyright (c) Meta Platforms, Inc. and affiliates.
//
// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

use std::io::BufRead;
use std::thread;
use std::thread::JoinHandle;

use crossbeam::channel::Sender;
use log::debug;
use log::error;
use log::info;
use log::warn;
use serde::de::DeserializeOwned;
use serde_json::json;
use serde_json::Value;
use thiserror::Error;

use super::protocol::*;
use crate::service::OpenArgs;
use crate::service::SchedulerService;
use crate::service::SessionError;

#[derive(Debug, Error)]
enum RpcFailure {
    #[error("method not found: {0}")]
    MethodNotFound(String),

    #[error("invalid params: {0}")]
    InvalidParams(String),

    #[error("{0}")]
    Service(String),

    #[error("backend busy")]
    Busy,
}

impl From<SessionError> for RpcFailure {
    fn from(err: SessionError) -> Self {
        match err {
            SessionError::Busy => RpcFailure::Busy,
            err => RpcFailure::Service(err.to_string()),
        }
    }
}

impl From<serde_json::Error> for RpcFailure {
    fn from(err: serde_json::Error) -> Self {
        RpcFailure::InvalidParams(err.to_string())
    }
}

impl RpcFailure {
    fn to_error(&self, method: &str) -> JsonRpcError {
        match self {
            RpcFailure::MethodNotFound(_) => JsonRpcError::method_not_found(method),
            RpcFailure::InvalidParams(msg) => JsonRpcError::invalid_params(msg),
            RpcFailure::Service(msg) => JsonRpcError::service_error(msg),
            RpcFailure::Busy => JsonRpcError::service_error(&self.to_string()),
        }
    }
}

fn params<T: DeserializeOwned>(request: &JsonRpcRequest) -> Result<T, RpcFailure> {
    let params = request
        .params
        .clone()
        .ok_or_else(|| RpcFailure::InvalidParams("missing params".to_string()))?;
    Ok(serde_json::from_value(params)?)
}

/// Methods that create, kill or query threads and their sessions' backend
/// resources. These are served on a context of their own since the backend
/// may call back into the scheduler while serving them.
pub fn is_thread_method(method: &str) -> bool {
    matches!(
        method,
        "create_thread"
            | "kill_thread"
            | "exception_sigh"
            | "affinity_space"
            | "trace_control"
            | "ref_account"
            | "transfer_quota"
            | "quota"
            | "native_cpu"
    )
}

/// Session-context methods that call into the backend.
pub fn is_backend_method(method: &str) -> bool {
    matches!(method, "open_session" | "upgrade" | "close_session")
}

/// Method name of a request line, if it parses.
pub fn request_method(line: &str) -> Option<String> {
    serde_json::from_str::<JsonRpcRequest>(line)
        .ok()
        .map(|r| r.method)
}

/// Serves the session-management methods on top of a [`SchedulerService`].
pub struct RpcServer<'a> {
    service: &'a SchedulerService,
}

impl<'a> RpcServer<'a> {
    pub fn new(service: &'a SchedulerService) -> Self {
        Self { service }
    }

    /// Handle one request line and produce its response.
    pub fn handle_request(&self, line: &str) -> JsonRpcResponse {
        self.respond(line, false)
            .unwrap_or_else(|| JsonRpcResponse::failure(None, JsonRpcError::parse_error()))
    }

    /// Like [`RpcServer::handle_request`], but returns `None` without side
    /// effects if the request has to wait for the backend.
    pub fn try_handle_request(&self, line: &str) -> Option<JsonRpcResponse> {
        self.respond(line, true)
    }

    fn respond(&self, line: &str, defer_busy: bool) -> Option<JsonRpcResponse> {
        let request: JsonRpcRequest = match serde_json::from_str(line) {
            Ok(req) => req,
            Err(e) => {
                error!("rpc: failed to parse request: {}", e);
                return Some(JsonRpcResponse::failure(None, JsonRpcError::parse_error()));
            }
        };

        match self.dispatch_method(&request) {
            Ok(result) => Some(JsonRpcResponse::success(request.id, result)),
            Err(RpcFailure::Busy) if defer_busy => {
                debug!("rpc: {} deferred, backend busy", request.method);
                None
            }
            Err(e) => {
                warn!("rpc: {} failed: {}", request.method, e);
                Some(JsonRpcResponse::failure(request.id, e.to_error(&request.method)))
            }
        }
    }

    fn dispatch_method(&self, request: &JsonRpcRequest) -> Result<Value, RpcFailure> {
        let service = self.service;
        match request.method.as_str() {
            "open_session" => {
                let args: OpenArgs = params(request)?;
                let id = service.open_session(args)?;
                Ok(json!({ "session": id }))
            }
            "upgrade" => {
                let p: UpgradeParams = params(request)?;
                service.upgrade(p.session, p.ram, p.caps)?;
                Ok(json!({}))
            }
            "close_session" => {
                let p: SessionParams = params(request)?;
                service.close_session(p.session)?;
                Ok(json!({}))
            }
            "create_thread" => {
                let p: CreateThreadParams = params(request)?;
                let thread =
                    service.create_thread(p.session, p.pd, &p.name, p.location, p.weight, p.utcb)?;
                Ok(json!({ "thread": thread }))
            }
            "kill_thread" => {
                let p: KillThreadParams = params(request)?;
                service.kill_thread(p.session, p.thread)?;
                Ok(json!({}))
            }
            "exception_sigh" => {
                let p: ExceptionSighParams = params(request)?;
                service.exception_sigh(p.session, p.handler)?;
                Ok(json!({}))
            }
            "affinity_space" => {
                let p: SessionParams = params(request)?;
                Ok(serde_json::to_value(service.affinity_space(p.session)?)?)
            }
            "trace_control" => {
                let p: SessionParams = params(request)?;
                Ok(json!({ "capability": service.trace_control(p.session)? }))
            }
            "ref_account" => {
                let p: RefAccountParams = params(request)?;
                service.ref_account(p.session, p.account)?;
                Ok(json!({}))
            }
            "transfer_quota" => {
                let p: TransferQuotaParams = params(request)?;
                service.transfer_quota(p.session, p.to, p.amount)?;
                Ok(json!({}))
            }
            "quota" => {
                let p: SessionParams = params(request)?;
                Ok(serde_json::to_value(service.quota(p.session)?)?)
            }
            "native_cpu" => {
                let p: SessionParams = params(request)?;
                Ok(json!({ "capability": service.native_cpu(p.session)? }))
            }
            "status" => Ok(serde_json::to_value(service.status_report())?),
            "stats" => Ok(serde_json::to_value(service.metrics())?),
            "reload" => {
                service
                    .reload_config()
                    .map_err(|e| RpcFailure::Service(format!("{:#}", e)))?;
                Ok(json!({}))
            }
            "ping" => Ok(json!({})),
            method => Err(RpcFailure::MethodNotFound(method.to_string())),
        }
    }
}

/// Splits incoming requests between the session and the thread context.
/// Lines that do not parse go to the session context, which reports the
/// error.
pub struct RequestRouter {
    pub session: Sender<String>,
    pub thread: Sender<String>,
}

impl RequestRouter {
    /// Returns false once the receiving context is gone.
    pub fn route(&self, line: String) -> bool {
        let to_thread = request_method(&line).is_some_and(|m| is_thread_method(&m));
        let target = if to_thread { &self.thread } else { &self.session };
        target.send(line).is_ok()
    }
}

/// Route every non-empty line of `input` on a thread of its own. Both
/// channels disconnect once the input is exhausted.
pub fn spawn_reader<R>(input: R, router: RequestRouter) -> std::io::Result<JoinHandle<()>>
where
    R: BufRead + Send + 'static,
{
    thread::Builder::new()
        .name("rpc-reader".to_string())
        .spawn(move || {
            for line in input.lines() {
                let line = match line {
                    Ok(line) => line,
                    Err(e) => {
                        error!("rpc: failed to read input: {}", e);
                        break;
                    }
                };
                if line.trim().is_empty() {
                    continue;
                }
                debug!("rpc: received {}", line);
                if !router.route(line) {
                    break;
                }
            }
            info!("rpc: input closed");
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::outbound::Outbound;
    use crate::testing::SimWorld;
    use crate::SESSION_SLOT_SIZE;

    fn call(server: &RpcServer<'_>, method: &str, params: Value) -> JsonRpcResponse {
        let line = json!({ "jsonrpc": "2.0", "method": method, "params": params, "id": 1 });
        server.handle_request(&line.to_string())
    }

    #[test]
    fn session_lifecycle() {
        let world = SimWorld::new(2, 1);
        let (outbound, _worker) = Outbound::spawn(world.parent_cpu()).unwrap();
        let service = SchedulerService::new(outbound, world.space(), Some(world.trace_factory()));
        let server = RpcServer::new(&service);

        let resp = call(
            &server,
            "open_session",
            json!({ "label": "init -> app", "ram_quota": SESSION_SLOT_SIZE, "space": { "width": 2, "height": 1 } }),
        );
        assert!(resp.error.is_none());
        let session = resp.result.unwrap()["session"].clone();
        assert_eq!(resp.id, Some(json!(1)));

        let resp = call(
            &server,
            "create_thread",
            json!({ "session": session, "pd": 1, "name": "ep" }),
        );
        let thread = resp.result.unwrap()["thread"].clone();

        let status = call(&server, "status", Value::Null).result.unwrap();
        assert_eq!(status["component"][0]["label"], "init -> app");
        assert_eq!(status["component"][0]["thread"][0]["name"], "ep");

        let space = call(&server, "affinity_space", json!({ "session": session }));
        assert_eq!(space.result.unwrap()["width"], 2);

        let resp = call(&server, "kill_thread", json!({ "session": session, "thread": thread }));
        assert!(resp.error.is_none());
        let resp = call(&server, "close_session", json!({ "session": session }));
        assert!(resp.error.is_none());
        assert_eq!(world.open_sessions(), 0);
    }

    #[test]
    fn error_codes() {
        let world = SimWorld::new(1, 1);
        let (outbound, _worker) = Outbound::spawn(world.parent_cpu()).unwrap();
        let service = SchedulerService::new(outbound, world.space(), None);
        let server = RpcServer::new(&service);

        let resp = server.handle_request("{ not json");
        assert_eq!(resp.error.unwrap().code, PARSE_ERROR);

        let resp = call(&server, "frobnicate", json!({}));
        assert_eq!(resp.error.unwrap().code, METHOD_NOT_FOUND);

        let resp = call(&server, "upgrade", json!({ "ram": 1 }));
        assert_eq!(resp.error.unwrap().code, INVALID_PARAMS);

        let resp = call(&server, "open_session", json!({ "label": "a", "ram_quota": 0 }));
        let err = resp.error.unwrap();
        assert_eq!(err.code, SERVICE_ERROR);
        assert!(err.message.contains("insufficient"));

        let resp = call(&server, "quota", json!({ "session": 7 }));
        assert_eq!(resp.error.unwrap().code, SERVICE_ERROR);
    }

    #[test]
    fn reader_routes_lines() {
        let (session_tx, session_rx) = crossbeam::channel::unbounded();
        let (thread_tx, thread_rx) = crossbeam::channel::unbounded();
        let input = std::io::Cursor::new(
            concat!(
                "{\"jsonrpc\":\"2.0\",\"method\":\"status\",\"id\":1}\n",
                "\n  \n",
                "{\"jsonrpc\":\"2.0\",\"method\":\"create_thread\",\"id\":2}\n",
                "{ not json\n",
            )
            .as_bytes()
            .to_vec(),
        );
        let router = RequestRouter {
            session: session_tx,
            thread: thread_tx,
        };
        spawn_reader(input, router).unwrap().join().unwrap();

        let session: Vec<String> = session_rx.iter().collect();
        let thread: Vec<String> = thread_rx.iter().collect();
        assert_eq!(session.len(), 2);
        assert!(session[0].contains("status"));
        assert_eq!(session[1], "{ not json");
        assert_eq!(thread.len(), 1);
        assert!(thread[0].contains("create_thread"));
    }

    #[test]
    fn busy_backend_defers_session_methods() {
        let world = SimWorld::new(1, 1);
        let (outbound, _worker) = Outbound::spawn(world.parent_cpu()).unwrap();
        let service = std::sync::Arc::new(SchedulerService::new(outbound, world.space(), None));
        let open = json!({
            "jsonrpc": "2.0",
            "method": "open_session",
            "params": { "label": "a", "ram_quota": SESSION_SLOT_SIZE },
            "id": 5
        })
        .to_string();
        let session = RpcServer::new(&service)
            .handle_request(&open)
            .result
            .unwrap()["session"]
            .clone();

        let (seen_tx, seen_rx) = crossbeam::channel::unbounded();
        let weak = std::sync::Arc::downgrade(&service);
        let line = open.clone();
        world.on_create_thread(move || {
            let Some(service) = weak.upgrade() else {
                return;
            };
            let server = RpcServer::new(&service);
            let deferred = server.try_handle_request(&line).is_none();
            let busy = server.handle_request(&line).error.map(|e| e.code);
            let status = server.try_handle_request(r#"{"jsonrpc":"2.0","method":"status","id":6}"#);
            seen_tx.send((deferred, busy, status.is_some())).unwrap();
        });

        let resp = call(
            &RpcServer::new(&service),
            "create_thread",
            json!({ "session": session, "pd": 1, "name": "ep" }),
        );
        assert!(resp.error.is_none());
        assert_eq!(seen_rx.try_recv().unwrap(), (true, Some(SERVICE_ERROR), true));
        assert_eq!(world.open_sessions(), 1);
    }
}
