//! The mock HTTP server: transport wiring and per-request correlation.
//!
//! A single fallback handler owns every inbound request: resolve candidates,
//! dispatch, then proxy, then 404. Each request gets a correlation id and a
//! `mock-start` event up front; the response body is wrapped so the matching
//! `mock-end` event reports whether the response finished or the client went
//! away first.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use axum::body::{Body, Bytes};
use axum::extract::{Request, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::Response;
use axum::Router;
use http_body::{Frame, SizeHint};
use tokio::net::TcpListener;
use tokio::sync::{broadcast, RwLock};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::config::ServerConfig;
use crate::dispatch::respond_with_mocks;
use crate::error::Error;
use crate::events::{EventBus, RequestOutcome, ServerEvent};
use crate::matcher::MockRequest;
use crate::mock::{HandlerArgs, HandlerVerdict, MockValue};
use crate::proxy::ProxyDispatch;
use crate::registry::{MockRegistry, SourceRank};
use crate::render::{render_not_found, Rendered, StatusMessage};
use crate::resolve::recurse_for_mocks;
use crate::shutdown::Shutdown;
use crate::watch::{WatchCoordinator, WatchHandle, WatchSource, WatchState};

/// The mock server, configured but not yet listening.
pub struct MockServer {
    config: ServerConfig,
    registry: Arc<RwLock<MockRegistry>>,
    events: EventBus,
    shutdown: Shutdown,
    watch_source: Option<Box<dyn WatchSource>>,
}

impl MockServer {
    /// Create a server from a resolved configuration.
    pub fn new(config: ServerConfig) -> Self {
        Self {
            config,
            registry: Arc::new(RwLock::new(MockRegistry::new())),
            events: EventBus::new(),
            shutdown: Shutdown::new(),
            watch_source: None,
        }
    }

    /// Create from a YAML configuration string.
    pub fn from_yaml(yaml: &str) -> Result<Self, serde_yaml::Error> {
        let config: ServerConfig = serde_yaml::from_str(yaml)?;
        Ok(Self::new(config))
    }

    /// Replace the file-system watch mechanism.
    pub fn with_watch_source(mut self, source: Box<dyn WatchSource>) -> Self {
        self.watch_source = Some(source);
        self
    }

    /// Subscribe to observation events. Subscribing before [`start`] catches
    /// startup errors too.
    ///
    /// [`start`]: MockServer::start
    pub fn events(&self) -> broadcast::Receiver<ServerEvent> {
        self.events.subscribe()
    }

    /// A handle that can trigger shutdown from anywhere.
    pub fn shutdown_handle(&self) -> Shutdown {
        self.shutdown.clone()
    }

    /// Register a mock value directly at a path.
    ///
    /// One programmatic mock per path: registering again at the same path
    /// replaces the previous value. Programmatic mocks outrank file mocks.
    pub async fn register_mock(&self, path: &str, value: MockValue) {
        self.registry
            .write()
            .await
            .set(&format!("registered:{path}"), SourceRank::Inline, path, value);
    }

    /// Register a handler mock at a path.
    pub async fn register_handler<F>(&self, path: &str, handler: F)
    where
        F: Fn(HandlerArgs<'_>) -> HandlerVerdict + Send + Sync + 'static,
    {
        self.register_mock(path, MockValue::Handler(Arc::new(handler)))
            .await;
    }

    /// Load the mocks, bind the port, and start serving.
    ///
    /// Returns once the initial scan is complete and the socket is bound.
    /// Startup failures are emitted on the event bus and returned.
    pub async fn start(self) -> Result<ServerHandle, Error> {
        if let Err(err) = self.config.validate() {
            self.events.emit(ServerEvent::Error(err.to_string()));
            return Err(err);
        }

        let coordinator = match WatchCoordinator::new(
            &self.config,
            Arc::clone(&self.registry),
            self.events.clone(),
        ) {
            Ok(coordinator) => coordinator,
            Err(err) => {
                self.events.emit(ServerEvent::Error(err.to_string()));
                return Err(err);
            }
        };

        let watch = match coordinator.run(self.watch_source, &self.shutdown).await {
            Ok(handle) => handle,
            Err(err) => {
                self.events.emit(ServerEvent::Error(err.to_string()));
                return Err(err);
            }
        };

        let proxy = match ProxyDispatch::from_config(&self.config.proxy_apis) {
            Ok(proxy) => proxy.map(Arc::new),
            Err(err) => {
                self.events.emit(ServerEvent::Error(err.to_string()));
                return Err(err);
            }
        };

        let state = AppState {
            registry: Arc::clone(&self.registry),
            events: self.events.clone(),
            proxy,
        };
        let app = Router::new().fallback(handle_request).with_state(state);

        let bind_addr = SocketAddr::from(([0, 0, 0, 0], self.config.port));
        let listener = match TcpListener::bind(bind_addr).await {
            Ok(listener) => listener,
            Err(source) => {
                let err = Error::Bind {
                    port: self.config.port,
                    source,
                };
                self.events.emit(ServerEvent::Error(err.to_string()));
                return Err(err);
            }
        };
        let addr = listener.local_addr().map_err(|source| Error::Bind {
            port: self.config.port,
            source,
        })?;

        let shutdown = self.shutdown.clone();
        let events = self.events.clone();
        let server_task = tokio::spawn(async move {
            let mut rx = shutdown.subscribe();
            let result = axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    let _ = rx.recv().await;
                })
                .await;
            if let Err(err) = result {
                error!(%err, "server error");
                events.emit(ServerEvent::Error(err.to_string()));
            }
        });

        info!(address = %addr, "mock server listening");

        Ok(ServerHandle {
            addr,
            events: self.events,
            shutdown: self.shutdown,
            watch,
            server_task,
        })
    }
}

/// A running server.
pub struct ServerHandle {
    addr: SocketAddr,
    events: EventBus,
    shutdown: Shutdown,
    watch: WatchHandle,
    server_task: JoinHandle<()>,
}

impl ServerHandle {
    /// The bound address (the actual port when 0 was configured).
    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn events(&self) -> broadcast::Receiver<ServerEvent> {
        self.events.subscribe()
    }

    pub fn watch_state(&self) -> WatchState {
        self.watch.state()
    }

    /// Request shutdown. One-way and idempotent.
    pub fn shutdown(&self) {
        self.shutdown.trigger();
    }

    /// Wait for the server and the watch coordinator to stop.
    pub async fn wait(self) {
        let _ = self.server_task.await;
        self.watch.closed().await;
    }
}

#[derive(Clone)]
struct AppState {
    registry: Arc<RwLock<MockRegistry>>,
    events: EventBus,
    proxy: Option<Arc<ProxyDispatch>>,
}

async fn handle_request(State(state): State<AppState>, request: Request) -> Response {
    let correlation_id = Uuid::new_v4();
    let mock_request = MockRequest::from_parts(
        request.method(),
        request.uri(),
        request.version(),
        request.headers(),
    );

    state.events.emit(ServerEvent::MockStart {
        correlation_id,
        method: mock_request.method.clone(),
        url: mock_request.url.clone(),
    });
    // Armed from here on: if this future is dropped or the client goes away
    // before the response completes, the end event says closed-early.
    let reporter = EndReporter::new(state.events.clone(), correlation_id, mock_request.url.clone());

    let groups = {
        let registry = state.registry.read().await;
        recurse_for_mocks(&registry, &mock_request.path)
    };

    if let Some(rendered) = respond_with_mocks(&mock_request, &groups).await {
        return rendered_response(rendered, reporter);
    }

    if let Some(proxy) = state.proxy.as_ref() {
        if let Some(rule) = proxy.matches(&mock_request.url) {
            match proxy.forward(rule, request).await {
                Ok(upstream) => {
                    state.events.emit(ServerEvent::ProxyResponse {
                        correlation_id,
                        status: upstream.status().as_u16(),
                    });
                    return piped_response(upstream, reporter);
                }
                Err(err) => {
                    warn!(%err, url = %mock_request.url, "upstream request failed");
                    return rendered_response(bad_gateway(), reporter);
                }
            }
        }
    }

    rendered_response(render_not_found(), reporter)
}

fn rendered_response(rendered: Rendered, reporter: EndReporter) -> Response {
    let body = TrackedBody::new(
        FullBody {
            data: Some(rendered.body),
            trailers: rendered.trailers,
        },
        reporter,
    );
    let mut response = Response::new(Body::new(body));
    *response.status_mut() = rendered.status;
    *response.headers_mut() = rendered.headers;
    if let Some(message) = rendered.status_message {
        response.extensions_mut().insert(StatusMessage(message));
    }
    response
}

fn piped_response(upstream: Response<Body>, reporter: EndReporter) -> Response {
    let (parts, body) = upstream.into_parts();
    Response::from_parts(parts, Body::new(TrackedBody::new(body, reporter)))
}

fn bad_gateway() -> Rendered {
    Rendered {
        status: StatusCode::BAD_GATEWAY,
        status_message: None,
        headers: HeaderMap::new(),
        body: Bytes::from_static(b"Bad Gateway"),
        trailers: None,
        delay: Duration::ZERO,
    }
}

/// Emits the `mock-end` event exactly once: `finished` when the body was
/// consumed to the end, `closed-early` otherwise.
struct EndReporter {
    events: EventBus,
    correlation_id: Uuid,
    url: String,
    finished: bool,
}

impl EndReporter {
    fn new(events: EventBus, correlation_id: Uuid, url: String) -> Self {
        Self {
            events,
            correlation_id,
            url,
            finished: false,
        }
    }

    fn finish(&mut self) {
        if !self.finished {
            self.finished = true;
            self.events.emit(ServerEvent::MockEnd {
                correlation_id: self.correlation_id,
                outcome: RequestOutcome::Finished,
                url: self.url.clone(),
            });
        }
    }
}

impl Drop for EndReporter {
    fn drop(&mut self) {
        if !self.finished {
            self.events.emit(ServerEvent::MockEnd {
                correlation_id: self.correlation_id,
                outcome: RequestOutcome::ClosedEarly,
                url: self.url.clone(),
            });
        }
    }
}

/// A one-shot body: a data frame, then optional trailers.
struct FullBody {
    data: Option<Bytes>,
    trailers: Option<HeaderMap>,
}

impl http_body::Body for FullBody {
    type Data = Bytes;
    type Error = Infallible;

    fn poll_frame(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let this = self.get_mut();
        if let Some(data) = this.data.take() {
            return Poll::Ready(Some(Ok(Frame::data(data))));
        }
        if let Some(trailers) = this.trailers.take() {
            return Poll::Ready(Some(Ok(Frame::trailers(trailers))));
        }
        Poll::Ready(None)
    }

    fn is_end_stream(&self) -> bool {
        self.data.is_none() && self.trailers.is_none()
    }

    fn size_hint(&self) -> SizeHint {
        match &self.data {
            Some(data) => SizeHint::with_exact(data.len() as u64),
            None => SizeHint::with_exact(0),
        }
    }
}

/// Wraps a response body and tells the reporter whether it was consumed to
/// completion.
struct TrackedBody<B> {
    inner: B,
    reporter: EndReporter,
}

impl<B> TrackedBody<B> {
    fn new(inner: B, reporter: EndReporter) -> Self {
        Self { inner, reporter }
    }
}

impl<B> http_body::Body for TrackedBody<B>
where
    B: http_body::Body<Data = Bytes> + Unpin,
{
    type Data = Bytes;
    type Error = B::Error;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let this = self.get_mut();
        let result = Pin::new(&mut this.inner).poll_frame(cx);
        match &result {
            Poll::Ready(None) => this.reporter.finish(),
            Poll::Ready(Some(Ok(_))) => {
                if this.inner.is_end_stream() {
                    this.reporter.finish();
                }
            }
            _ => {}
        }
        result
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn from_yaml_builds_a_server() {
        let server = MockServer::from_yaml("port: 0\nwatch: false\n").unwrap();
        assert_eq!(server.config.port, 0);
    }

    #[tokio::test]
    async fn registered_mocks_land_in_the_registry() {
        let server = MockServer::new(ServerConfig::default());
        server
            .register_mock("/answer", MockValue::Literal(json!(42)))
            .await;

        let registry = server.registry.read().await;
        assert_eq!(registry.get("/answer").len(), 1);
        assert_eq!(registry.get("/answer/").len(), 1);
    }

    #[tokio::test]
    async fn re_registering_replaces_the_previous_mock() {
        let server = MockServer::new(ServerConfig::default());
        server
            .register_mock("/answer", MockValue::Literal(json!(1)))
            .await;
        server
            .register_mock("/answer", MockValue::Literal(json!(2)))
            .await;

        let registry = server.registry.read().await;
        let mocks = registry.get("/answer");
        assert_eq!(mocks.len(), 1);
        match mocks[0].as_ref() {
            MockValue::Literal(v) => assert_eq!(v, &json!(2)),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn end_reporter_reports_closed_early_on_drop() {
        let events = EventBus::new();
        let mut rx = events.subscribe();
        let reporter = EndReporter::new(events, Uuid::new_v4(), "/x".to_string());
        drop(reporter);

        match rx.recv().await.unwrap() {
            ServerEvent::MockEnd { outcome, .. } => {
                assert_eq!(outcome, RequestOutcome::ClosedEarly)
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn end_reporter_reports_finished_exactly_once() {
        let events = EventBus::new();
        let mut rx = events.subscribe();
        let mut reporter = EndReporter::new(events, Uuid::new_v4(), "/x".to_string());
        reporter.finish();
        drop(reporter);

        match rx.recv().await.unwrap() {
            ServerEvent::MockEnd { outcome, .. } => {
                assert_eq!(outcome, RequestOutcome::Finished)
            }
            other => panic!("unexpected event {other:?}"),
        }
        assert!(rx.try_recv().is_err());
    }
}
