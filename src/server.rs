//! Server engine: routes incoming HTTP requests into the protocol's
//! operations and drives GraphQL execution into SSE streams.
//!
//! Routing is by method and headers. `PUT` reserves a single-connection
//! stream, `GET` with a token header attaches to it, `POST` submits an
//! operation (into the reservation when a token is present, as its own
//! distinct stream otherwise), `DELETE` cancels one, and a plain `GET`
//! serves the operation encoded in its query string for `EventSource`
//! clients.

use crate::error::{ErrorCode, TransportError, TransportResult};
use crate::execution::{ExecutionOutcome, GraphqlEngine, RequestContext};
use crate::protocol::{ExecutionResult, OperationRequest, StreamMessage, STREAM_TOKEN_HEADER};
use crate::registry::{generate_token, StreamRegistry};
use crate::sse::EventSink;
use bytes::Bytes;
use http::request::Parts;
use http_body_util::{BodyExt, Full};
use hyper::{Method, Response, StatusCode};
use serde_json::Value;
use std::collections::HashMap;
use std::convert::Infallible;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, error};

pub(crate) type BoxBody = http_body_util::combinators::BoxBody<Bytes, Infallible>;

pub(crate) fn full<T: Into<Bytes>>(chunk: T) -> BoxBody {
    Full::new(chunk.into()).boxed()
}

fn empty() -> BoxBody {
    full(Bytes::new())
}

type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send>>;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Cadence of the `:` comment keep-alive on open streams.
    pub keep_alive_interval: Duration,
    /// How long an unclaimed reservation may sit idle before eviction;
    /// submissions against it reset the clock.
    pub reservation_timeout: Duration,
    /// Buffered records per stream; the bounded window that paces
    /// producers when the consumer is slow or not yet attached.
    pub sink_capacity: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl ServerConfig {
    /// Creates a config with default values.
    pub fn new() -> Self {
        Self {
            keep_alive_interval: Duration::from_secs(12),
            reservation_timeout: Duration::from_secs(10),
            sink_capacity: 64,
        }
    }

    /// Sets the keep-alive cadence.
    pub fn keep_alive_interval(mut self, interval: Duration) -> Self {
        self.keep_alive_interval = interval;
        self
    }

    /// Sets the unclaimed-reservation timeout.
    pub fn reservation_timeout(mut self, timeout: Duration) -> Self {
        self.reservation_timeout = timeout;
        self
    }

    /// Sets the per-stream buffer capacity.
    pub fn sink_capacity(mut self, capacity: usize) -> Self {
        self.sink_capacity = capacity;
        self
    }
}

/// A verbatim response produced by a hook instead of the normal flow.
#[derive(Debug, Clone, Default)]
pub struct ResponseOverride {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Option<String>,
}

impl ResponseOverride {
    /// Creates an override with the given status.
    pub fn new(status: u16) -> Self {
        Self {
            status,
            ..Default::default()
        }
    }

    /// Adds a header.
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Sets the body.
    pub fn body(mut self, body: impl Into<String>) -> Self {
        self.body = Some(body.into());
        self
    }
}

/// Outcome of the `authenticate` hook.
pub enum AuthOutcome {
    /// Proceed with this token in scope; empty means "no token"
    /// (distinct mode).
    Token(String),
    /// Send this response verbatim.
    Response(ResponseOverride),
}

/// Outcome of the `on_subscribe` hook.
pub enum SubscribeOutcome {
    /// Execute this (possibly rewritten) request instead.
    Request(OperationRequest),
    /// Send this response verbatim.
    Response(ResponseOverride),
}

type AuthenticateFn =
    Arc<dyn Fn(RequestContext) -> BoxFuture<TransportResult<AuthOutcome>> + Send + Sync>;
type ContextFn = Arc<dyn Fn(RequestContext) -> BoxFuture<Value> + Send + Sync>;
type OnSubscribeFn = Arc<
    dyn Fn(RequestContext, OperationRequest) -> BoxFuture<TransportResult<Option<SubscribeOutcome>>>
        + Send
        + Sync,
>;
type OnResultFn = Arc<
    dyn Fn(RequestContext, OperationRequest, ExecutionResult) -> BoxFuture<Option<ExecutionResult>>
        + Send
        + Sync,
>;
type OnCompleteFn = Arc<dyn Fn(RequestContext, Option<String>) -> BoxFuture<()> + Send + Sync>;

struct ServerInner {
    engine: Arc<dyn GraphqlEngine>,
    registry: StreamRegistry,
    config: ServerConfig,
    authenticate: Option<AuthenticateFn>,
    context: Option<ContextFn>,
    on_subscribe: Option<OnSubscribeFn>,
    on_operation: Option<OnResultFn>,
    on_next: Option<OnResultFn>,
    on_complete: Option<OnCompleteFn>,
}

/// Builder for [`SseServer`].
pub struct SseServerBuilder {
    inner: ServerInner,
}

impl SseServerBuilder {
    fn new(engine: Arc<dyn GraphqlEngine>) -> Self {
        Self {
            inner: ServerInner {
                engine,
                registry: StreamRegistry::new(),
                config: ServerConfig::new(),
                authenticate: None,
                context: None,
                on_subscribe: None,
                on_operation: None,
                on_next: None,
                on_complete: None,
            },
        }
    }

    /// Sets the configuration.
    pub fn config(mut self, config: ServerConfig) -> Self {
        self.inner.config = config;
        self
    }

    /// Installs the authentication hook, invoked before routing. It
    /// returns either the token the request proceeds with (empty for
    /// distinct mode) or a response to send verbatim.
    pub fn authenticate<F, Fut>(mut self, hook: F) -> Self
    where
        F: Fn(RequestContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = TransportResult<AuthOutcome>> + Send + 'static,
    {
        self.inner.authenticate = Some(Arc::new(move |ctx| Box::pin(hook(ctx))));
        self
    }

    /// Installs the context hook; its value is handed to the engine in
    /// `RequestContext::context_value`.
    pub fn context<F, Fut>(mut self, hook: F) -> Self
    where
        F: Fn(RequestContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Value> + Send + 'static,
    {
        self.inner.context = Some(Arc::new(move |ctx| Box::pin(hook(ctx))));
        self
    }

    /// Installs the subscription hook, invoked for every accepted
    /// operation before execution. It may rewrite the request (persisted
    /// queries) or short-circuit with a response.
    pub fn on_subscribe<F, Fut>(mut self, hook: F) -> Self
    where
        F: Fn(RequestContext, OperationRequest) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = TransportResult<Option<SubscribeOutcome>>> + Send + 'static,
    {
        self.inner.on_subscribe = Some(Arc::new(move |ctx, request| Box::pin(hook(ctx, request))));
        self
    }

    /// Installs the post-execution hook for single-result operations.
    pub fn on_operation<F, Fut>(mut self, hook: F) -> Self
    where
        F: Fn(RequestContext, OperationRequest, ExecutionResult) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Option<ExecutionResult>> + Send + 'static,
    {
        self.inner.on_operation = Some(Arc::new(move |ctx, request, result| {
            Box::pin(hook(ctx, request, result))
        }));
        self
    }

    /// Installs the per-value hook, applied to every emitted `next`
    /// payload.
    pub fn on_next<F, Fut>(mut self, hook: F) -> Self
    where
        F: Fn(RequestContext, OperationRequest, ExecutionResult) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Option<ExecutionResult>> + Send + 'static,
    {
        self.inner.on_next = Some(Arc::new(move |ctx, request, result| {
            Box::pin(hook(ctx, request, result))
        }));
        self
    }

    /// Installs the completion hook, invoked once per operation after
    /// its terminal event.
    pub fn on_complete<F, Fut>(mut self, hook: F) -> Self
    where
        F: Fn(RequestContext, Option<String>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.inner.on_complete = Some(Arc::new(move |ctx, id| Box::pin(hook(ctx, id))));
        self
    }

    /// Builds the server.
    pub fn build(self) -> SseServer {
        SseServer {
            inner: Arc::new(self.inner),
        }
    }
}

/// The GraphQL-over-SSE server engine. Cheap to clone; clones share all
/// state including the stream registry.
#[derive(Clone)]
pub struct SseServer {
    inner: Arc<ServerInner>,
}

impl SseServer {
    /// Creates a builder around the given execution engine.
    pub fn builder(engine: impl GraphqlEngine) -> SseServerBuilder {
        SseServerBuilder::new(Arc::new(engine))
    }

    /// Returns the stream registry.
    pub fn registry(&self) -> &StreamRegistry {
        &self.inner.registry
    }

    /// Returns the configuration.
    pub fn config(&self) -> &ServerConfig {
        &self.inner.config
    }

    /// Handles one request, fully buffered. The HTTP binding collects
    /// the body and maps the response onto its connection.
    pub async fn dispatch(&self, parts: Parts, body: Bytes) -> Response<BoxBody> {
        match self.route(parts, body).await {
            Ok(response) => response,
            Err(err) => error_response(err),
        }
    }

    async fn route(&self, parts: Parts, body: Bytes) -> TransportResult<Response<BoxBody>> {
        let mut ctx = RequestContext {
            method: parts.method.as_str().to_string(),
            headers: header_map(&parts),
            token: String::new(),
            context_value: None,
        };

        ctx.token = match &self.inner.authenticate {
            Some(hook) => match hook(ctx.clone()).await? {
                AuthOutcome::Token(token) => token,
                AuthOutcome::Response(over) => return Ok(override_response(over)),
            },
            None => default_token(&ctx),
        };

        if let Some(hook) = &self.inner.context {
            ctx.context_value = Some(hook(ctx.clone()).await);
        }

        debug!(method = %parts.method, token = %ctx.token, "dispatching request");

        match parts.method.clone() {
            Method::PUT => self.handle_reserve(ctx).await,
            Method::GET if !ctx.token.is_empty() && accepts_event_stream(&ctx) => {
                self.handle_attach(ctx).await
            }
            Method::GET => {
                let request =
                    OperationRequest::from_query_string(parts.uri.query().unwrap_or(""))?;
                self.handle_distinct(ctx, request).await
            }
            Method::POST => {
                let request: OperationRequest = serde_json::from_slice(&body).map_err(|e| {
                    TransportError::bad_request(format!("invalid request body: {}", e))
                })?;
                if !ctx.token.is_empty() {
                    self.handle_single_submit(ctx, request).await
                } else if accepts_event_stream(&ctx) {
                    self.handle_distinct(ctx, request).await
                } else {
                    Err(TransportError::bad_request(
                        "missing accept: text/event-stream",
                    ))
                }
            }
            Method::DELETE => self.handle_cancel(ctx, &parts).await,
            _ => Err(TransportError::new(
                ErrorCode::MethodNotAllowed,
                "unsupported method",
            )),
        }
    }

    /// `PUT`: reserve a single-connection stream and answer with its
    /// token.
    async fn handle_reserve(&self, ctx: RequestContext) -> TransportResult<Response<BoxBody>> {
        let token = if ctx.token.is_empty() {
            generate_token()
        } else {
            ctx.token
        };
        self.inner
            .registry
            .reserve(&token, self.inner.config.sink_capacity)
            .await?;

        let server = self.clone();
        let unclaimed = token.clone();
        tokio::spawn(async move {
            let timeout = server.inner.config.reservation_timeout;
            let mut wait = timeout;
            loop {
                tokio::time::sleep(wait).await;
                match server.inner.registry.idle_for(&unclaimed).await {
                    None => break,
                    // Touched since the last check; re-arm for the
                    // remainder of the idle window.
                    Some(idle) if idle < timeout => wait = timeout - idle,
                    Some(_) => {
                        if server.inner.registry.evict_unclaimed(&unclaimed).await {
                            debug!(token = %unclaimed, "evicted idle unclaimed stream reservation");
                        }
                        break;
                    }
                }
            }
        });

        Ok(Response::builder()
            .status(StatusCode::OK)
            .header("content-type", "text/plain; charset=utf-8")
            .body(full(token))
            .unwrap())
    }

    /// `GET` with a token: attach the event stream to its reservation.
    async fn handle_attach(&self, ctx: RequestContext) -> TransportResult<Response<BoxBody>> {
        let body = self.inner.registry.attach(&ctx.token).await?;
        let sink = self.inner.registry.sink(&ctx.token).await?;

        tokio::spawn(keep_alive(
            sink.clone(),
            self.inner.config.keep_alive_interval,
        ));

        // When the consumer goes away, cancel everything in the
        // reservation and drop it.
        let server = self.clone();
        let token = ctx.token.clone();
        tokio::spawn(async move {
            sink.closed().await;
            server.inner.registry.remove(&token).await;
        });

        Ok(sse_response(body.boxed()))
    }

    /// `POST` with a token: accept an operation into the reservation and
    /// answer `202` once it is registered.
    async fn handle_single_submit(
        &self,
        ctx: RequestContext,
        request: OperationRequest,
    ) -> TransportResult<Response<BoxBody>> {
        let request = match self.run_on_subscribe(&ctx, request).await? {
            SubscribeOutcome::Request(request) => request,
            SubscribeOutcome::Response(over) => return Ok(override_response(over)),
        };

        let id = match request.operation_id() {
            Some(id) if !id.is_empty() => id.to_string(),
            _ => {
                return Err(TransportError::bad_request(
                    "missing extensions.operationId",
                ))
            }
        };

        let sink = self.inner.registry.sink(&ctx.token).await?;
        let (stop_tx, stop_rx) = oneshot::channel();
        self.inner
            .registry
            .register_operation(&ctx.token, &id, stop_tx)
            .await?;

        let server = self.clone();
        let token = ctx.token.clone();
        let op_id = id.clone();
        tokio::spawn(async move {
            server
                .execute_and_forward(ctx, request, Some(op_id.clone()), sink, Some(stop_rx))
                .await;
            server.inner.registry.finish_operation(&token, &op_id).await;
        });

        Ok(Response::builder()
            .status(StatusCode::ACCEPTED)
            .body(empty())
            .unwrap())
    }

    /// Distinct mode: execute and stream the result as the response
    /// body. Parse/validation failures become a `400` before any
    /// streaming starts.
    async fn handle_distinct(
        &self,
        ctx: RequestContext,
        request: OperationRequest,
    ) -> TransportResult<Response<BoxBody>> {
        let request = match self.run_on_subscribe(&ctx, request).await? {
            SubscribeOutcome::Request(request) => request,
            SubscribeOutcome::Response(over) => return Ok(override_response(over)),
        };

        let outcome = match self.inner.engine.run(&ctx, request.clone()).await {
            Ok(outcome) => outcome,
            Err(errors) => {
                let body = serde_json::to_string(&serde_json::json!({ "errors": errors }))
                    .map_err(|e| TransportError::serialize(e.to_string()))?;
                return Ok(Response::builder()
                    .status(StatusCode::BAD_REQUEST)
                    .header("content-type", "application/json")
                    .body(full(body))
                    .unwrap());
            }
        };

        let (sink, body) = EventSink::channel(self.inner.config.sink_capacity);
        let server = self.clone();
        let period = self.inner.config.keep_alive_interval;
        tokio::spawn(async move {
            let ticker = tokio::spawn(keep_alive(sink.clone(), period));
            server
                .forward_outcome(&ctx, &request, None, outcome, &sink, &mut None)
                .await;
            ticker.abort();
        });

        Ok(sse_response(body.boxed()))
    }

    /// `DELETE`: cancel one operation in a reservation.
    async fn handle_cancel(
        &self,
        ctx: RequestContext,
        parts: &Parts,
    ) -> TransportResult<Response<BoxBody>> {
        if ctx.token.is_empty() {
            return Err(TransportError::bad_request("missing stream token"));
        }
        let id = parts
            .uri
            .query()
            .and_then(|query| {
                url::form_urlencoded::parse(query.as_bytes())
                    .find(|(key, _)| key == "operationId")
                    .map(|(_, value)| value.into_owned())
            })
            .ok_or_else(|| TransportError::bad_request("missing operationId parameter"))?;

        if self.inner.registry.cancel_operation(&ctx.token, &id).await {
            Ok(Response::builder()
                .status(StatusCode::OK)
                .body(empty())
                .unwrap())
        } else {
            Err(TransportError::not_found("operation"))
        }
    }

    async fn run_on_subscribe(
        &self,
        ctx: &RequestContext,
        request: OperationRequest,
    ) -> TransportResult<SubscribeOutcome> {
        match &self.inner.on_subscribe {
            Some(hook) => Ok(hook(ctx.clone(), request.clone())
                .await?
                .unwrap_or(SubscribeOutcome::Request(request))),
            None => Ok(SubscribeOutcome::Request(request)),
        }
    }

    /// Runs the engine (unless already cancelled) and forwards its
    /// outcome. Used by the single-connection path, where execution
    /// happens after the `202` has been sent.
    async fn execute_and_forward(
        &self,
        ctx: RequestContext,
        request: OperationRequest,
        id: Option<String>,
        sink: EventSink,
        mut stop: Option<oneshot::Receiver<()>>,
    ) {
        let run = self.inner.engine.run(&ctx, request.clone());
        let outcome = match stop.as_mut() {
            Some(stop_rx) => tokio::select! {
                _ = stop_rx => {
                    // Cancelled before execution resolved; the operation
                    // still terminates like any other.
                    let _ = self.send_complete(&sink, id.as_deref()).await;
                    self.run_on_complete(&ctx, id).await;
                    return;
                }
                outcome = run => outcome,
            },
            None => run.await,
        };

        match outcome {
            Ok(outcome) => {
                self.forward_outcome(&ctx, &request, id.as_deref(), outcome, &sink, &mut stop)
                    .await;
            }
            Err(errors) => {
                // Validation failure after acceptance travels in-band.
                let payload = ExecutionResult::from_errors(errors);
                if self.send_next(&sink, id.as_deref(), payload).await.is_ok() {
                    let _ = self.send_complete(&sink, id.as_deref()).await;
                }
                self.run_on_complete(&ctx, id).await;
            }
        }
    }

    /// Forwards one execution outcome into the sink: every value as a
    /// `next`, then exactly one `complete`. Producer errors become a
    /// final `next` carrying the error, then `complete`.
    async fn forward_outcome(
        &self,
        ctx: &RequestContext,
        request: &OperationRequest,
        id: Option<&str>,
        outcome: ExecutionOutcome,
        sink: &EventSink,
        stop: &mut Option<oneshot::Receiver<()>>,
    ) {
        match outcome {
            ExecutionOutcome::Single(result) => {
                let result = self
                    .apply_hook(&self.inner.on_operation, ctx, request, result)
                    .await;
                let result = self.apply_hook(&self.inner.on_next, ctx, request, result).await;
                if self.send_next(sink, id, result).await.is_ok() {
                    let _ = self.send_complete(sink, id).await;
                }
            }
            ExecutionOutcome::Stream(mut stream) => {
                loop {
                    let item = match stop.as_mut() {
                        Some(stop_rx) => tokio::select! {
                            _ = stop_rx => break,
                            item = stream.next() => item,
                        },
                        None => tokio::select! {
                            _ = sink.closed() => break,
                            item = stream.next() => item,
                        },
                    };
                    match item {
                        Some(Ok(result)) => {
                            let result =
                                self.apply_hook(&self.inner.on_next, ctx, request, result).await;
                            if self.send_next(sink, id, result).await.is_err() {
                                break;
                            }
                        }
                        Some(Err(producer_error)) => {
                            let result = ExecutionResult::from_errors(vec![producer_error]);
                            let result =
                                self.apply_hook(&self.inner.on_next, ctx, request, result).await;
                            let _ = self.send_next(sink, id, result).await;
                            break;
                        }
                        None => break,
                    }
                }
                // Dropping the stream here is what runs the producer's
                // cleanup on cancellation.
                let _ = self.send_complete(sink, id).await;
            }
        }
        self.run_on_complete(ctx, id.map(str::to_string)).await;
    }

    async fn apply_hook(
        &self,
        hook: &Option<OnResultFn>,
        ctx: &RequestContext,
        request: &OperationRequest,
        result: ExecutionResult,
    ) -> ExecutionResult {
        match hook {
            Some(hook) => hook(ctx.clone(), request.clone(), result.clone())
                .await
                .unwrap_or(result),
            None => result,
        }
    }

    async fn run_on_complete(&self, ctx: &RequestContext, id: Option<String>) {
        if let Some(hook) = &self.inner.on_complete {
            hook(ctx.clone(), id).await;
        }
    }

    async fn send_next(
        &self,
        sink: &EventSink,
        id: Option<&str>,
        payload: ExecutionResult,
    ) -> TransportResult<()> {
        let record = StreamMessage::Next {
            id: id.map(str::to_string),
            payload,
        }
        .encode()?;
        sink.send_record(record).await
    }

    async fn send_complete(&self, sink: &EventSink, id: Option<&str>) -> TransportResult<()> {
        let record = StreamMessage::Complete {
            id: id.map(str::to_string),
        }
        .encode()?;
        sink.send_record(record).await
    }
}

/// Emits the comment keep-alive until the stream closes.
async fn keep_alive(sink: EventSink, period: Duration) {
    let mut interval = tokio::time::interval(period);
    interval.tick().await;
    loop {
        interval.tick().await;
        if sink.send_comment().await.is_err() {
            break;
        }
    }
}

fn default_token(ctx: &RequestContext) -> String {
    if ctx.method == "PUT" {
        generate_token()
    } else {
        ctx.header(STREAM_TOKEN_HEADER).unwrap_or("").to_string()
    }
}

fn accepts_event_stream(ctx: &RequestContext) -> bool {
    ctx.header("accept")
        .map(|accept| accept.contains("text/event-stream"))
        .unwrap_or(false)
}

fn header_map(parts: &Parts) -> HashMap<String, String> {
    parts
        .headers
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|v| (name.as_str().to_ascii_lowercase(), v.to_string()))
        })
        .collect()
}

fn sse_response(body: BoxBody) -> Response<BoxBody> {
    Response::builder()
        .status(StatusCode::OK)
        .header("content-type", "text/event-stream")
        .header("cache-control", "no-cache")
        .header("connection", "keep-alive")
        .body(body)
        .unwrap()
}

fn override_response(over: ResponseOverride) -> Response<BoxBody> {
    let status = StatusCode::from_u16(over.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let mut builder = Response::builder().status(status);
    for (name, value) in &over.headers {
        builder = builder.header(name, value);
    }
    builder.body(full(over.body.unwrap_or_default())).unwrap()
}

fn error_response(err: TransportError) -> Response<BoxBody> {
    let (status, message) = match err.code {
        ErrorCode::BadRequest => (StatusCode::BAD_REQUEST, err.message),
        ErrorCode::Unauthorized => (StatusCode::UNAUTHORIZED, err.message),
        ErrorCode::NotFound => (StatusCode::NOT_FOUND, err.message),
        ErrorCode::MethodNotAllowed => (StatusCode::METHOD_NOT_ALLOWED, err.message),
        ErrorCode::Conflict => (StatusCode::CONFLICT, err.message),
        _ => {
            // Internal details stay on this side of the wire.
            error!(error = %err, "request failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                "internal server error".to_string(),
            )
        }
    };
    let body = serde_json::json!({ "errors": [{ "message": message }] }).to_string();
    Response::builder()
        .status(status)
        .header("content-type", "application/json")
        .body(full(body))
        .unwrap()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::GraphqlError;
    use async_trait::async_trait;
    use hyper::Request;
    use serde_json::json;

    struct HelloEngine;

    #[async_trait]
    impl GraphqlEngine for HelloEngine {
        async fn run(
            &self,
            _ctx: &RequestContext,
            request: OperationRequest,
        ) -> Result<ExecutionOutcome, Vec<GraphqlError>> {
            if request.query.contains("hello") {
                Ok(ExecutionOutcome::Single(ExecutionResult::data(
                    json!({"hello": "world"}),
                )))
            } else {
                Err(vec![GraphqlError::new("unknown field")])
            }
        }
    }

    fn parts(request: Request<()>) -> Parts {
        request.into_parts().0
    }

    #[tokio::test]
    async fn test_reserve_returns_token() {
        let server = SseServer::builder(HelloEngine).build();
        let request = Request::builder()
            .method(Method::PUT)
            .uri("/graphql/stream")
            .body(())
            .unwrap();

        let response = server.dispatch(parts(request), Bytes::new()).await;
        assert_eq!(response.status(), StatusCode::OK);

        let token = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(token.len(), 32);
        assert_eq!(server.registry().len().await, 1);
    }

    #[tokio::test]
    async fn test_attach_unknown_token_is_not_found() {
        let server = SseServer::builder(HelloEngine).build();
        let request = Request::builder()
            .method(Method::GET)
            .uri("/graphql/stream")
            .header(STREAM_TOKEN_HEADER, "deadbeef")
            .header("accept", "text/event-stream")
            .body(())
            .unwrap();

        let response = server.dispatch(parts(request), Bytes::new()).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_attach_requires_event_stream_accept() {
        let server = SseServer::builder(HelloEngine).build();
        server.registry().reserve("tok", 8).await.unwrap();

        // Without the accept header the request is distinct-mode, and
        // with no query string that is a bad request, not an attach.
        let request = Request::builder()
            .method(Method::GET)
            .uri("/graphql/stream")
            .header(STREAM_TOKEN_HEADER, "tok")
            .body(())
            .unwrap();

        let response = server.dispatch(parts(request), Bytes::new()).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert!(server.registry().attach("tok").await.is_ok());
    }

    #[tokio::test]
    async fn test_single_submit_requires_operation_id() {
        let server = SseServer::builder(HelloEngine).build();
        server.registry().reserve("tok", 8).await.unwrap();

        let request = Request::builder()
            .method(Method::POST)
            .uri("/graphql/stream")
            .header(STREAM_TOKEN_HEADER, "tok")
            .body(())
            .unwrap();
        let body = serde_json::to_vec(&OperationRequest::new("{ hello }")).unwrap();

        let response = server.dispatch(parts(request), Bytes::from(body)).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_post_without_accept_or_token_rejected() {
        let server = SseServer::builder(HelloEngine).build();
        let request = Request::builder()
            .method(Method::POST)
            .uri("/graphql/stream")
            .body(())
            .unwrap();
        let body = serde_json::to_vec(&OperationRequest::new("{ hello }")).unwrap();

        let response = server.dispatch(parts(request), Bytes::from(body)).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_unsupported_method() {
        let server = SseServer::builder(HelloEngine).build();
        let request = Request::builder()
            .method(Method::PATCH)
            .uri("/graphql/stream")
            .body(())
            .unwrap();

        let response = server.dispatch(parts(request), Bytes::new()).await;
        assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
    }

    #[tokio::test]
    async fn test_distinct_validation_failure_is_400() {
        let server = SseServer::builder(HelloEngine).build();
        let request = Request::builder()
            .method(Method::POST)
            .uri("/graphql/stream")
            .header("accept", "text/event-stream")
            .body(())
            .unwrap();
        let body = serde_json::to_vec(&OperationRequest::new("{ nope }")).unwrap();

        let response = server.dispatch(parts(request), Bytes::from(body)).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let body = response.into_body().collect().await.unwrap().to_bytes();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["errors"][0]["message"], "unknown field");
    }

    #[tokio::test]
    async fn test_distinct_query_streams_next_then_complete() {
        let server = SseServer::builder(HelloEngine).build();
        let request = Request::builder()
            .method(Method::POST)
            .uri("/graphql/stream")
            .header("accept", "text/event-stream")
            .body(())
            .unwrap();
        let body = serde_json::to_vec(&OperationRequest::new("{ hello }")).unwrap();

        let response = server.dispatch(parts(request), Bytes::from(body)).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()["content-type"], "text/event-stream");

        let wire = response.into_body().collect().await.unwrap().to_bytes();
        let mut parser = crate::sse::SseParser::new();
        let events = parser.feed(&wire).unwrap();
        let messages: Vec<_> = events
            .iter()
            .map(|e| StreamMessage::from_event(e).unwrap())
            .collect();
        assert_eq!(
            messages,
            vec![
                StreamMessage::Next {
                    id: None,
                    payload: ExecutionResult::data(json!({"hello": "world"})),
                },
                StreamMessage::Complete { id: None },
            ]
        );
    }

    #[tokio::test]
    async fn test_distinct_get_query_string() {
        let server = SseServer::builder(HelloEngine).build();
        let request = Request::builder()
            .method(Method::GET)
            .uri("/graphql/stream?query=%7B%20hello%20%7D")
            .header("accept", "text/event-stream")
            .body(())
            .unwrap();

        let response = server.dispatch(parts(request), Bytes::new()).await;
        assert_eq!(response.status(), StatusCode::OK);

        let wire = response.into_body().collect().await.unwrap().to_bytes();
        let text = String::from_utf8(wire.to_vec()).unwrap();
        assert!(text.contains("event: next"));
        assert!(text.contains("event: complete"));
    }

    #[tokio::test]
    async fn test_authenticate_override_short_circuits() {
        let server = SseServer::builder(HelloEngine)
            .authenticate(|_ctx| async {
                Ok(AuthOutcome::Response(
                    ResponseOverride::new(401).body("who are you"),
                ))
            })
            .build();

        let request = Request::builder()
            .method(Method::PUT)
            .uri("/graphql/stream")
            .body(())
            .unwrap();
        let response = server.dispatch(parts(request), Bytes::new()).await;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert!(server.registry().is_empty().await);
    }
}
