//! In-memory transport for exercising the adapters without node processes.
//!
//! Routes are matched newest first, so a test can register defaults up front
//! and override individual endpoints later.

use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use regnet_core::{Error, Result};
use serde_json::{Value, json};

use crate::transport::{HttpRequest, HttpTransport, Method};

type Handler = Box<dyn Fn(&HttpRequest) -> Result<Value> + Send + Sync>;

struct Route {
    method: Method,
    port: Option<u16>,
    path: String,
    rpc: Option<String>,
    handler: Handler,
}

impl Route {
    fn matches(&self, request: &HttpRequest) -> bool {
        if self.method != request.method {
            return false;
        }
        if self.port.is_some() && self.port != request.port() {
            return false;
        }
        let path_matches = self.path.strip_suffix('*').map_or_else(
            || request.path() == self.path,
            |prefix| request.path().starts_with(prefix),
        );
        path_matches
            && self
                .rpc
                .as_deref()
                .is_none_or(|name| rpc_method(request) == Some(name))
    }
}

fn rpc_method(request: &HttpRequest) -> Option<&str> {
    request.json_body().get("method").and_then(Value::as_str)
}

/// A scripted [`HttpTransport`] that records every request it receives.
#[derive(Default)]
pub struct FakeTransport {
    routes: Mutex<Vec<Route>>,
    calls: Mutex<Vec<HttpRequest>>,
}

impl std::fmt::Debug for FakeTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FakeTransport")
            .field("calls", &self.calls().len())
            .finish_non_exhaustive()
    }
}

impl FakeTransport {
    /// Create a transport with no routes.
    pub fn new() -> Self {
        Self::default()
    }

    fn push(&self, route: Route) {
        self.routes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(route);
    }

    /// Answer `method path` on any port. A trailing `*` matches by prefix.
    pub fn on<F>(&self, method: Method, path: &str, handler: F)
    where
        F: Fn(&HttpRequest) -> Result<Value> + Send + Sync + 'static,
    {
        self.push(Route {
            method,
            port: None,
            path: path.to_string(),
            rpc: None,
            handler: Box::new(handler),
        });
    }

    /// Answer `method path` on a single port.
    pub fn on_port<F>(&self, port: u16, method: Method, path: &str, handler: F)
    where
        F: Fn(&HttpRequest) -> Result<Value> + Send + Sync + 'static,
    {
        self.push(Route {
            method,
            port: Some(port),
            path: path.to_string(),
            rpc: None,
            handler: Box::new(handler),
        });
    }

    /// Answer the JSON-RPC method `name` on any port. The handler receives
    /// the call's params and its result is wrapped in a JSON-RPC envelope.
    pub fn on_rpc<F>(&self, name: &str, handler: F)
    where
        F: Fn(&Value) -> Result<Value> + Send + Sync + 'static,
    {
        self.push(Route {
            method: Method::Post,
            port: None,
            path: "/".to_string(),
            rpc: Some(name.to_string()),
            handler: Box::new(move |request| {
                let params = request.json_body().get("params").cloned();
                let result = handler(&params.unwrap_or(Value::Null))?;
                Ok(json!({ "result": result, "error": null, "id": rpc_id(request) }))
            }),
        });
    }

    /// Every request received so far, oldest first.
    pub fn calls(&self) -> Vec<HttpRequest> {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Number of requests received for `method path`.
    pub fn count(&self, method: Method, path: &str) -> usize {
        self.calls()
            .iter()
            .filter(|r| r.method == method && r.path() == path)
            .count()
    }

    /// Params of every JSON-RPC call to `name`, oldest first.
    pub fn rpc_calls(&self, name: &str) -> Vec<Value> {
        self.calls()
            .iter()
            .filter(|r| rpc_method(r) == Some(name))
            .map(|r| r.json_body().get("params").cloned().unwrap_or(Value::Null))
            .collect()
    }
}

fn rpc_id(request: &HttpRequest) -> Value {
    request.json_body().get("id").cloned().unwrap_or(Value::Null)
}

#[async_trait]
impl HttpTransport for FakeTransport {
    async fn send(&self, request: HttpRequest) -> Result<Value> {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(request.clone());

        let routes = self.routes.lock().unwrap_or_else(PoisonError::into_inner);
        routes
            .iter()
            .rev()
            .find(|route| route.matches(&request))
            .map_or_else(
                || {
                    Err(Error::Transport(format!(
                        "connect ECONNREFUSED {:?} {}",
                        request.method, request.url
                    )))
                },
                |route| (route.handler)(&request),
            )
    }
}
