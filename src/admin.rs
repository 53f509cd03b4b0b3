use crate::backend::{BackendGroup, UnitAction, UnitError};
use crate::error::{json_error_response, ApiErrorCode};
use crate::lifecycle::LifecycleController;
use crate::relay::UdpRelay;
use http_body_util::Full;
use hyper::body::Bytes;
use hyper::header::AUTHORIZATION;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use serde_json::json;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Version information for the proxy
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const PKG_NAME: &str = env!("CARGO_PKG_NAME");

/// Helper to create a simple response - infallible with valid StatusCode
fn response(status: StatusCode, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .body(Full::new(body.into()))
        .expect("valid response with StatusCode enum")
}

/// Helper to create a JSON response
fn json_response(status: StatusCode, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .header("content-type", "application/json")
        .body(Full::new(body.into()))
        .expect("valid response with StatusCode enum and static header")
}

/// Everything a request handler can reach
struct AdminState {
    relay: Arc<UdpRelay>,
    controller: Option<LifecycleController>,
    auth_token: String,
}

impl AdminState {
    fn group(&self) -> Option<&BackendGroup> {
        self.controller.as_ref().map(|c| c.group())
    }
}

/// HTTP control surface for the relay and its backend
pub struct AdminServer {
    state: Arc<AdminState>,
    shutdown_rx: watch::Receiver<bool>,
}

impl AdminServer {
    pub fn new(
        relay: Arc<UdpRelay>,
        controller: Option<LifecycleController>,
        shutdown_rx: watch::Receiver<bool>,
        auth_token: String,
    ) -> Self {
        Self {
            state: Arc::new(AdminState {
                relay,
                controller,
                auth_token,
            }),
            shutdown_rx,
        }
    }

    /// Serve on an already bound listener
    pub async fn serve(self, listener: TcpListener) -> anyhow::Result<()> {
        let addr = listener.local_addr()?;
        info!(addr = %addr, "Admin API server listening (HTTP/1.1 and HTTP/2)");

        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let state = Arc::clone(&self.state);
                            tokio::spawn(async move {
                                if let Err(e) = serve_admin_connection(stream, state).await {
                                    debug!(addr = %addr, error = %e, "Admin connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept admin connection");
                        }
                    }
                }
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        info!("Admin server shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

async fn serve_admin_connection<S>(stream: S, state: Arc<AdminState>) -> anyhow::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let io = TokioIo::new(stream);
    let service = service_fn(move |req| {
        let state = Arc::clone(&state);
        async move { handle_admin_request(req, state).await }
    });

    AutoBuilder::new(TokioExecutor::new())
        .serve_connection(io, service)
        .await
        .map_err(|e| anyhow::anyhow!("Admin connection error: {}", e))?;

    Ok(())
}

fn check_auth<B>(req: &Request<B>, expected_token: &str) -> bool {
    req.headers()
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .map(|auth| {
            // Support "Bearer <token>" format
            auth.strip_prefix("Bearer ")
                .unwrap_or(auth)
                .eq(expected_token)
        })
        .unwrap_or(false)
}

fn backend_disabled() -> Response<Full<Bytes>> {
    json_error_response(
        ApiErrorCode::BackendDisabled,
        "no container or container group is configured",
    )
}

async fn handle_admin_request<B>(
    req: Request<B>,
    state: Arc<AdminState>,
) -> Result<Response<Full<Bytes>>, hyper::Error> {
    let path = req.uri().path().trim_end_matches('/');
    let method = req.method();

    debug!(%method, %path, "Admin API request");

    // Health and version need no auth
    match (method, path) {
        (&Method::GET, "/health") => return Ok(response(StatusCode::OK, "ok")),
        (&Method::GET, "/version") => {
            let version_info = json!({
                "name": PKG_NAME,
                "version": VERSION,
            });
            return Ok(json_response(StatusCode::OK, version_info.to_string()));
        }
        _ => {}
    }

    if !check_auth(&req, &state.auth_token) {
        warn!(path, "Unauthorized admin API request");
        return Ok(json_error_response(
            ApiErrorCode::Unauthorized,
            "missing or invalid bearer token",
        ));
    }

    let segments: Vec<&str> = path.trim_start_matches('/').split('/').collect();

    let response = match (method, segments.as_slice()) {
        (&Method::GET, ["info"]) => info(&state).await,
        (&Method::GET, ["proxy"]) => proxy_info(&state),
        (&Method::POST, ["proxy", "trigger"]) => match &state.controller {
            Some(controller) => {
                controller.simulate_connection();
                json_response(StatusCode::ACCEPTED, json!({ "triggered": true }).to_string())
            }
            None => backend_disabled(),
        },
        (&Method::GET, ["lifecycle"]) => match &state.controller {
            Some(controller) => match serde_json::to_string(&controller.status()) {
                Ok(body) => json_response(StatusCode::OK, body),
                Err(e) => {
                    error!(error = %e, "Failed to serialize lifecycle status");
                    json_error_response(ApiErrorCode::InternalError, "failed to serialize lifecycle status")
                }
            },
            None => backend_disabled(),
        },
        (_, ["containers", ..]) => match state.group() {
            Some(group) => containers(method, &segments[1..], group).await,
            None => backend_disabled(),
        },
        _ => json_error_response(ApiErrorCode::NotFound, format!("no route for {} {}", method, path)),
    };

    Ok(response)
}

async fn info(state: &AdminState) -> Response<Full<Bytes>> {
    let container_group = match state.group() {
        Some(group) => json!({
            "name": group.name(),
            "state": group.state().await,
        }),
        None => serde_json::Value::Null,
    };

    let body = json!({
        "connections": state.relay.connection_count(),
        "lifecycle": state.controller.as_ref().map(|c| c.status()),
        "containerGroup": container_group,
    });
    json_response(StatusCode::OK, body.to_string())
}

fn proxy_info(state: &AdminState) -> Response<Full<Bytes>> {
    let body = json!({
        "connections": state.relay.connection_count(),
        "port": state.relay.listening_port(),
        "targetAddress": state.relay.target_address(),
    });
    json_response(StatusCode::OK, body.to_string())
}

async fn containers(method: &Method, rest: &[&str], group: &BackendGroup) -> Response<Full<Bytes>> {
    match (method, rest) {
        (&Method::GET, []) => {
            let units: Vec<serde_json::Value> = group
                .unit_states()
                .await
                .into_iter()
                .map(|(unit, state)| json!({ "id": unit.id, "name": unit.name, "state": state }))
                .collect();
            json_response(StatusCode::OK, serde_json::Value::from(units).to_string())
        }

        (&Method::GET, [id]) => match group.unit(id) {
            Some(unit) => {
                let state = match group.unit_state(id).await {
                    Ok(state) => state,
                    Err(e) => return unit_error(e),
                };
                json_response(
                    StatusCode::OK,
                    json!({ "id": unit.id, "name": unit.name, "state": state }).to_string(),
                )
            }
            None => unknown_container(id),
        },

        (&Method::POST, [action]) => match UnitAction::parse(action) {
            Some(action) => {
                info!(group = %group.name(), action = action.as_str(), "Group action requested via admin API");
                let failures = group.apply(action).await;
                if failures > 0 {
                    json_error_response(
                        ApiErrorCode::BackendActionFailed,
                        format!(
                            "{} failed for {} of {} containers",
                            action.as_str(),
                            failures,
                            group.units().len()
                        ),
                    )
                } else {
                    json_response(
                        StatusCode::OK,
                        json!({ "action": action.as_str(), "containers": group.units().len() })
                            .to_string(),
                    )
                }
            }
            None => json_error_response(ApiErrorCode::NotFound, format!("unknown action '{}'", action)),
        },

        (&Method::POST, [id, action]) => match UnitAction::parse(action) {
            Some(action) => match group.apply_to(id, action).await {
                Ok(()) => json_response(
                    StatusCode::OK,
                    json!({ "id": id, "action": action.as_str() }).to_string(),
                ),
                Err(e) => unit_error(e),
            },
            None => json_error_response(ApiErrorCode::NotFound, format!("unknown action '{}'", action)),
        },

        _ => json_error_response(ApiErrorCode::NotFound, "no such container route"),
    }
}

fn unknown_container(id: &str) -> Response<Full<Bytes>> {
    json_error_response(
        ApiErrorCode::UnknownContainer,
        format!("container '{}' is not part of the managed group", id),
    )
}

fn unit_error(e: UnitError) -> Response<Full<Bytes>> {
    match e {
        UnitError::UnknownUnit(id) => unknown_container(&id),
        UnitError::Driver(e) => json_error_response(ApiErrorCode::BackendActionFailed, e.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{BackendDriver, BackendUnit, UnitState};
    use crate::config::ProxyConfig;
    use crate::lifecycle::{LifecyclePolicy, ShutdownAction};
    use async_trait::async_trait;
    use http_body_util::BodyExt;
    use parking_lot::Mutex;
    use std::collections::HashMap;
    use std::time::Duration;

    const TOKEN: &str = "secret";

    struct StaticDriver {
        states: Mutex<HashMap<String, UnitState>>,
    }

    impl StaticDriver {
        fn set(&self, id: &str, state: UnitState) -> anyhow::Result<()> {
            match self.states.lock().get_mut(id) {
                Some(s) => {
                    *s = state;
                    Ok(())
                }
                None => anyhow::bail!("no such container {}", id),
            }
        }
    }

    #[async_trait]
    impl BackendDriver for StaticDriver {
        async fn start_unit(&self, id: &str) -> anyhow::Result<()> {
            self.set(id, UnitState::Running)
        }
        async fn stop_unit(&self, id: &str) -> anyhow::Result<()> {
            self.set(id, UnitState::Stopped)
        }
        async fn pause_unit(&self, id: &str) -> anyhow::Result<()> {
            self.set(id, UnitState::Paused)
        }
        async fn unpause_unit(&self, id: &str) -> anyhow::Result<()> {
            self.set(id, UnitState::Running)
        }
        async fn inspect_unit(&self, id: &str) -> anyhow::Result<UnitState> {
            self.states
                .lock()
                .get(id)
                .copied()
                .ok_or_else(|| anyhow::anyhow!("no such container {}", id))
        }
    }

    async fn state(with_backend: bool) -> Arc<AdminState> {
        let relay = UdpRelay::bind(
            &ProxyConfig {
                bind: "127.0.0.1".to_string(),
                target_address: Some("127.0.0.1:9".to_string()),
                ..Default::default()
            },
            None,
        )
        .await
        .unwrap();

        let controller = with_backend.then(|| {
            let driver = Arc::new(StaticDriver {
                states: Mutex::new(HashMap::from([
                    ("c1".to_string(), UnitState::Running),
                    ("c2".to_string(), UnitState::Stopped),
                ])),
            });
            let group = BackendGroup::new(
                "game",
                vec![BackendUnit::new("c1", "game-a"), BackendUnit::new("c2", "game-b")],
                driver,
            );
            LifecycleController::new(
                group,
                LifecyclePolicy {
                    shutdown_delay: Duration::from_secs(60),
                    action: ShutdownAction::Stop,
                    pause_duration: Duration::ZERO,
                },
            )
        });

        Arc::new(AdminState {
            relay,
            controller,
            auth_token: TOKEN.to_string(),
        })
    }

    fn request(method: Method, path: &str) -> Request<()> {
        Request::builder()
            .method(method)
            .uri(path)
            .header(AUTHORIZATION, format!("Bearer {}", TOKEN))
            .body(())
            .unwrap()
    }

    async fn call(state: &Arc<AdminState>, req: Request<()>) -> (StatusCode, serde_json::Value) {
        let resp = handle_admin_request(req, Arc::clone(state)).await.unwrap();
        let status = resp.status();
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        let value = serde_json::from_slice(&body).unwrap_or(serde_json::Value::Null);
        (status, value)
    }

    #[tokio::test]
    async fn test_health_and_version_need_no_auth() {
        let state = state(false).await;
        let req = Request::builder().uri("/health").body(()).unwrap();
        let resp = handle_admin_request(req, Arc::clone(&state)).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        let req = Request::builder().uri("/version").body(()).unwrap();
        let (status, body) = call(&state, req).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["name"], PKG_NAME);
    }

    #[tokio::test]
    async fn test_auth_required() {
        let state = state(true).await;
        let req = Request::builder().uri("/proxy").body(()).unwrap();
        let (status, body) = call(&state, req).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["code"], "UNAUTHORIZED");

        let req = Request::builder()
            .uri("/proxy")
            .header(AUTHORIZATION, "Bearer wrong")
            .body(())
            .unwrap();
        assert_eq!(call(&state, req).await.0, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_proxy_info() {
        let state = state(false).await;
        let (status, body) = call(&state, request(Method::GET, "/proxy")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["connections"], 0);
        assert_eq!(body["port"], state.relay.listening_port());
        assert_eq!(body["targetAddress"], "127.0.0.1:9");
    }

    #[tokio::test]
    async fn test_lifecycle_status() {
        let state = state(true).await;
        let (status, body) = call(&state, request(Method::GET, "/lifecycle")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["state"], "idle");
        assert!(body["pending"].is_null());
        assert!(body["in_flight"].is_null());
    }

    #[tokio::test]
    async fn test_container_routes_disabled_without_backend() {
        let state = state(false).await;
        for (method, path) in [
            (Method::GET, "/containers"),
            (Method::POST, "/containers/start"),
            (Method::POST, "/proxy/trigger"),
            (Method::GET, "/lifecycle"),
        ] {
            let (status, body) = call(&state, request(method, path)).await;
            assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
            assert_eq!(body["code"], "BACKEND_DISABLED");
        }

        let (status, body) = call(&state, request(Method::GET, "/info")).await;
        assert_eq!(status, StatusCode::OK);
        assert!(body["containerGroup"].is_null());
    }

    #[tokio::test]
    async fn test_list_and_get_containers() {
        let state = state(true).await;
        let (status, body) = call(&state, request(Method::GET, "/containers")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body[0]["id"], "c1");
        assert_eq!(body[0]["state"], "running");
        assert_eq!(body[1]["name"], "game-b");
        assert_eq!(body[1]["state"], "stopped");

        let (status, body) = call(&state, request(Method::GET, "/containers/c2")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["name"], "game-b");

        let (status, body) = call(&state, request(Method::GET, "/containers/nope")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["code"], "UNKNOWN_CONTAINER");
    }

    #[tokio::test]
    async fn test_container_actions() {
        let state = state(true).await;

        let (status, _) = call(&state, request(Method::POST, "/containers/c1/pause")).await;
        assert_eq!(status, StatusCode::OK);
        let (_, body) = call(&state, request(Method::GET, "/info")).await;
        assert_eq!(body["containerGroup"]["state"], "paused");
        assert_eq!(body["lifecycle"]["state"], "idle");

        let (status, body) = call(&state, request(Method::POST, "/containers/start")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["containers"], 2);
        let (_, body) = call(&state, request(Method::GET, "/containers")).await;
        assert_eq!(body[1]["state"], "running");

        let (status, body) = call(&state, request(Method::POST, "/containers/ghost/stop")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["code"], "UNKNOWN_CONTAINER");

        let (status, _) = call(&state, request(Method::POST, "/containers/restart")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_unknown_route() {
        let state = state(true).await;
        let (status, body) = call(&state, request(Method::GET, "/nope")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["code"], "NOT_FOUND");
    }
}
