//! Client engine: opens SSE streams, parses them, and delivers each
//! operation's results to its sink.
//!
//! Two interoperating modes:
//! - distinct connections (default): every subscription is one `POST`
//!   whose response body is the event stream;
//! - single connection: a `PUT` reserves a stream token, a dedicated
//!   `GET` carries every operation's events, and per-operation
//!   `POST`/`DELETE` requests travel on their own connections (under
//!   HTTP/1 the open stream occupies its connection).
//!
//! Transport failures retry with backoff up to `retry_attempts`;
//! GraphQL errors delivered inside `next` payloads never retry.

use crate::error::{ErrorCode, TransportError, TransportResult};
use crate::protocol::{ExecutionResult, OperationRequest, StreamMessage, STREAM_TOKEN_HEADER};
use crate::sse::SseParser;
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::{Method, Request, StatusCode};
use hyper_util::rt::TokioIo;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send>>;
type RetryWaitFn = Arc<dyn Fn(u32) -> BoxFuture<()> + Send + Sync>;
type GenerateIdFn = Arc<dyn Fn() -> String + Send + Sync>;
type ErrorHandlerFn = Arc<dyn Fn(TransportError) + Send + Sync>;
type HeadersFn = Arc<dyn Fn() -> BoxFuture<HashMap<String, String>> + Send + Sync>;
type OnMessageFn = Arc<dyn Fn(&StreamMessage) + Send + Sync>;

/// Receiver of one operation's outcome.
///
/// Callbacks are invoked from the engine's own tasks, serialized per
/// subscription: zero or more `next` calls, then exactly one terminal
/// (`complete` or `error`), and nothing after the disposer returns.
/// Callbacks must not panic.
pub trait Sink: Send + Sync + 'static {
    fn next(&self, result: ExecutionResult);
    fn error(&self, error: TransportError);
    fn complete(&self);
}

/// Client configuration.
#[derive(Clone)]
pub struct ClientConfig {
    /// Endpoint URL (http only).
    pub url: String,
    /// Multiplex every operation over one reserved stream.
    pub single_connection: bool,
    /// Only hold the single-connection stream open while subscriptions
    /// are live.
    pub lazy: bool,
    /// Headers applied to every request.
    pub headers: HashMap<String, String>,
    /// Consecutive transport failures tolerated before giving up.
    pub retry_attempts: u32,
    /// TCP connect timeout.
    pub connect_timeout: Duration,
    retry_wait: Option<RetryWaitFn>,
    generate_id: Option<GenerateIdFn>,
    on_non_lazy_error: Option<ErrorHandlerFn>,
    headers_fn: Option<HeadersFn>,
    on_message: Option<OnMessageFn>,
}

impl ClientConfig {
    /// Creates a config with default values.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            single_connection: false,
            lazy: true,
            headers: HashMap::new(),
            retry_attempts: 5,
            connect_timeout: Duration::from_secs(30),
            retry_wait: None,
            generate_id: None,
            on_non_lazy_error: None,
            headers_fn: None,
            on_message: None,
        }
    }

    /// Enables single-connection mode.
    pub fn single_connection(mut self) -> Self {
        self.single_connection = true;
        self
    }

    /// Sets the lazy flag; only meaningful with single-connection mode.
    pub fn lazy(mut self, lazy: bool) -> Self {
        self.lazy = lazy;
        self
    }

    /// Adds a default header.
    pub fn header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    /// Sets the retry budget.
    pub fn retry_attempts(mut self, attempts: u32) -> Self {
        self.retry_attempts = attempts;
        self
    }

    /// Sets the TCP connect timeout.
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Replaces the backoff policy. The argument is the number of
    /// consecutive transport failures so far.
    pub fn retry_wait<F, Fut>(mut self, wait: F) -> Self
    where
        F: Fn(u32) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.retry_wait = Some(Arc::new(move |retries| Box::pin(wait(retries))));
        self
    }

    /// Replaces the operation id factory. Ids must be unique for the
    /// lifetime of the client.
    pub fn generate_id<F>(mut self, generate: F) -> Self
    where
        F: Fn() -> String + Send + Sync + 'static,
    {
        self.generate_id = Some(Arc::new(generate));
        self
    }

    /// Installs the handler for connection errors of an eager
    /// (non-lazy) single-connection client with no live subscriptions.
    pub fn on_non_lazy_error<F>(mut self, handler: F) -> Self
    where
        F: Fn(TransportError) + Send + Sync + 'static,
    {
        self.on_non_lazy_error = Some(Arc::new(handler));
        self
    }

    /// Installs a headers factory, resolved before every request and
    /// merged over the static headers. Useful for expiring credentials.
    pub fn dynamic_headers<F, Fut>(mut self, factory: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HashMap<String, String>> + Send + 'static,
    {
        self.headers_fn = Some(Arc::new(move || Box::pin(factory())));
        self
    }

    /// Installs a hook observing every protocol message the client
    /// receives, before routing. Meant for debugging.
    pub fn on_message<F>(mut self, hook: F) -> Self
    where
        F: Fn(&StreamMessage) + Send + Sync + 'static,
    {
        self.on_message = Some(Arc::new(hook));
        self
    }

    async fn resolve_headers(&self) -> HashMap<String, String> {
        match &self.headers_fn {
            Some(factory) => {
                let mut headers = self.headers.clone();
                headers.extend(factory().await);
                headers
            }
            None => self.headers.clone(),
        }
    }

    fn retry_wait_fn(&self) -> RetryWaitFn {
        self.retry_wait
            .clone()
            .unwrap_or_else(|| Arc::new(|retries| Box::pin(default_retry_wait(retries))))
    }

    fn generate_id_fn(&self) -> GenerateIdFn {
        self.generate_id
            .clone()
            .unwrap_or_else(|| Arc::new(|| Uuid::new_v4().to_string()))
    }
}

/// Default backoff: `min(1000 * 2^retries, 8000)` plus up to 3 s of
/// jitter.
async fn default_retry_wait(retries: u32) {
    let base = 1000u64
        .checked_shl(retries)
        .unwrap_or(u64::MAX)
        .min(8000);
    tokio::time::sleep(Duration::from_millis(base + jitter(3000))).await;
}

fn jitter(bound: u64) -> u64 {
    use std::collections::hash_map::DefaultHasher;
    use std::hash::{Hash, Hasher};
    use std::time::SystemTime;

    let mut hasher = DefaultHasher::new();
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos()
        .hash(&mut hasher);
    hasher.finish() % bound
}

// ============================================================================
// Sink plumbing
// ============================================================================

struct SinkState {
    disposed: bool,
    terminated: bool,
}

/// Wraps a user sink so that delivery is serialized and nothing fires
/// after disposal or a terminal event. Disposing takes the same lock a
/// delivery holds, so `dispose` returning means no callback is in
/// flight.
struct SharedSink {
    sink: Box<dyn Sink>,
    state: Mutex<SinkState>,
}

impl SharedSink {
    fn new(sink: impl Sink) -> Arc<Self> {
        Arc::new(Self {
            sink: Box::new(sink),
            state: Mutex::new(SinkState {
                disposed: false,
                terminated: false,
            }),
        })
    }

    fn next(&self, result: ExecutionResult) {
        let state = self.state.lock().unwrap();
        if !state.disposed && !state.terminated {
            self.sink.next(result);
        }
    }

    fn error(&self, error: TransportError) {
        let mut state = self.state.lock().unwrap();
        if !state.disposed && !state.terminated {
            state.terminated = true;
            self.sink.error(error);
        }
    }

    fn complete(&self) {
        let mut state = self.state.lock().unwrap();
        if !state.disposed && !state.terminated {
            state.terminated = true;
            self.sink.complete();
        }
    }

    fn dispose(&self) {
        self.state.lock().unwrap().disposed = true;
    }

    fn is_settled(&self) -> bool {
        let state = self.state.lock().unwrap();
        state.disposed || state.terminated
    }
}

/// Idempotent handle cancelling one subscription.
#[derive(Clone)]
pub struct Disposer {
    done: Arc<AtomicBool>,
    action: Arc<dyn Fn() + Send + Sync>,
}

impl std::fmt::Debug for Disposer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Disposer")
            .field("done", &self.done.load(Ordering::SeqCst))
            .finish()
    }
}

impl Disposer {
    fn new(action: impl Fn() + Send + Sync + 'static) -> Self {
        Self {
            done: Arc::new(AtomicBool::new(false)),
            action: Arc::new(action),
        }
    }

    /// Cancels the subscription. After this returns, no sink callback
    /// will fire. Subsequent calls are no-ops.
    pub fn dispose(&self) {
        if !self.done.swap(true, Ordering::SeqCst) {
            (self.action)();
        }
    }
}

// ============================================================================
// Client
// ============================================================================

struct ActiveSub {
    shared: Arc<SharedSink>,
    disposer: Disposer,
}

struct SingleConnection {
    commands: mpsc::UnboundedSender<Command>,
}

struct ClientInner {
    config: ClientConfig,
    endpoint: Endpoint,
    disposed: AtomicBool,
    subscriptions: Mutex<Vec<ActiveSub>>,
    single: Option<SingleConnection>,
}

/// The GraphQL-over-SSE client engine. Cheap to clone; clones share the
/// connection state, and disposing any clone disposes all of them.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

impl Client {
    /// Creates a distinct-connections client for the given URL.
    pub fn new(url: impl Into<String>) -> TransportResult<Self> {
        Self::with_config(ClientConfig::new(url))
    }

    /// Creates a client with configuration. A non-lazy single-connection
    /// client starts connecting immediately.
    pub fn with_config(config: ClientConfig) -> TransportResult<Self> {
        let endpoint = parse_endpoint(&config.url)?;
        let (single, commands_rx) = if config.single_connection {
            let (tx, rx) = mpsc::unbounded_channel();
            (Some(SingleConnection { commands: tx }), Some(rx))
        } else {
            (None, None)
        };

        let inner = Arc::new(ClientInner {
            config,
            endpoint,
            disposed: AtomicBool::new(false),
            subscriptions: Mutex::new(Vec::new()),
            single,
        });

        if let Some(commands) = commands_rx {
            // The runner must not keep the client alive: it gets its own
            // copies of the configuration and only a weak command sender,
            // so dropping the last client handle shuts it down.
            let weak_tx = match &inner.single {
                Some(single) => single.commands.downgrade(),
                None => unreachable!("single-connection state exists when commands do"),
            };
            tokio::spawn(run_single_connection(
                inner.config.clone(),
                inner.endpoint.clone(),
                weak_tx,
                commands,
            ));
        }

        Ok(Self { inner })
    }

    /// Subscribes `sink` to the given operation. The returned disposer
    /// cancels it; disposal guarantees no further callbacks.
    pub fn subscribe(
        &self,
        request: OperationRequest,
        sink: impl Sink,
    ) -> TransportResult<Disposer> {
        if self.inner.disposed.load(Ordering::SeqCst) {
            return Err(TransportError::disposed());
        }

        let shared = SharedSink::new(sink);
        let disposer = match &self.inner.single {
            Some(single) => {
                let key = (self.inner.config.generate_id_fn())();
                single
                    .commands
                    .send(Command::Subscribe {
                        key: key.clone(),
                        request,
                        shared: shared.clone(),
                    })
                    .map_err(|_| TransportError::disposed())?;

                let commands = single.commands.clone();
                let sink_handle = shared.clone();
                Disposer::new(move || {
                    sink_handle.dispose();
                    let _ = commands.send(Command::Dispose { key: key.clone() });
                })
            }
            None => {
                let (stop_tx, stop_rx) = oneshot::channel();
                let inner = self.inner.clone();
                let task_sink = shared.clone();
                let task_request = request;
                tokio::spawn(async move {
                    tokio::select! {
                        _ = stop_rx => {}
                        _ = run_distinct(&inner, &task_request, &task_sink) => {}
                    }
                });

                let stop = Mutex::new(Some(stop_tx));
                let sink_handle = shared.clone();
                Disposer::new(move || {
                    sink_handle.dispose();
                    if let Some(stop) = stop.lock().unwrap().take() {
                        let _ = stop.send(());
                    }
                })
            }
        };

        let mut subscriptions = self.inner.subscriptions.lock().unwrap();
        subscriptions.retain(|sub| !sub.shared.is_settled());
        subscriptions.push(ActiveSub {
            shared,
            disposer: disposer.clone(),
        });
        Ok(disposer)
    }

    /// Subscribes and exposes the results as an async sequence. Dropping
    /// the subscription disposes the operation.
    pub fn iterate(&self, request: OperationRequest) -> TransportResult<Subscription> {
        let (tx, rx) = mpsc::unbounded_channel();
        let disposer = self.subscribe(request, ChannelSink { events: tx })?;
        Ok(Subscription {
            events: rx,
            disposer,
            done: false,
        })
    }

    /// Tears the client down. Every active subscription receives an
    /// error and the physical streams are closed.
    pub fn dispose(&self) {
        if self.inner.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        let subs: Vec<ActiveSub> = self.inner.subscriptions.lock().unwrap().drain(..).collect();
        for sub in subs {
            sub.shared.error(TransportError::disposed());
            sub.disposer.dispose();
        }
        if let Some(single) = &self.inner.single {
            let _ = single.commands.send(Command::Shutdown);
        }
    }
}

enum IterEvent {
    Next(ExecutionResult),
    Error(TransportError),
    Complete,
}

struct ChannelSink {
    events: mpsc::UnboundedSender<IterEvent>,
}

impl Sink for ChannelSink {
    fn next(&self, result: ExecutionResult) {
        let _ = self.events.send(IterEvent::Next(result));
    }

    fn error(&self, error: TransportError) {
        let _ = self.events.send(IterEvent::Error(error));
    }

    fn complete(&self) {
        let _ = self.events.send(IterEvent::Complete);
    }
}

/// Async sequence of one operation's results, from [`Client::iterate`].
pub struct Subscription {
    events: mpsc::UnboundedReceiver<IterEvent>,
    disposer: Disposer,
    done: bool,
}

impl Subscription {
    /// Receives the next result. `None` means the operation completed.
    pub async fn next(&mut self) -> Option<TransportResult<ExecutionResult>> {
        if self.done {
            return None;
        }
        match self.events.recv().await {
            Some(IterEvent::Next(result)) => Some(Ok(result)),
            Some(IterEvent::Error(error)) => {
                self.done = true;
                Some(Err(error))
            }
            Some(IterEvent::Complete) | None => {
                self.done = true;
                None
            }
        }
    }

    /// Cancels the operation early; the sequence ends immediately.
    pub fn dispose(&mut self) {
        self.done = true;
        self.disposer.dispose();
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.disposer.dispose();
    }
}

// ============================================================================
// Distinct-connections mode
// ============================================================================

async fn run_distinct(
    inner: &Arc<ClientInner>,
    request: &OperationRequest,
    shared: &Arc<SharedSink>,
) {
    let retry_wait = inner.config.retry_wait_fn();
    let mut retries: u32 = 0;
    loop {
        match distinct_attempt(inner, request, shared).await {
            Ok(()) => return,
            Err(err) => {
                if !err.is_retryable() {
                    shared.error(err);
                    return;
                }
                if retries >= inner.config.retry_attempts {
                    shared.error(TransportError::retries_exhausted(retries + 1));
                    return;
                }
                debug!(error = %err, retries, "retrying operation stream");
                retry_wait(retries).await;
                retries += 1;
            }
        }
    }
}

/// One `POST` + stream consumption. Returns `Ok` once `complete` was
/// delivered; any earlier termination is a transport error.
async fn distinct_attempt(
    inner: &Arc<ClientInner>,
    request: &OperationRequest,
    shared: &Arc<SharedSink>,
) -> TransportResult<()> {
    let body = serde_json::to_vec(request).map_err(|e| TransportError::serialize(e.to_string()))?;
    let headers = inner.config.resolve_headers().await;
    let http_request = build_request(
        &inner.endpoint,
        &headers,
        Method::POST,
        &inner.endpoint.path,
        None,
        Some("text/event-stream"),
        Some(Bytes::from(body)),
    )?;

    let (response, conn) = send_request(&inner.endpoint, &inner.config, http_request).await?;
    let status = response.status();
    if status != StatusCode::OK {
        return Err(status_error(status));
    }

    let mut stream = EventStreamConn {
        body: response.into_body(),
        conn,
    };
    let mut parser = SseParser::new();
    loop {
        match stream.next_chunk().await? {
            Some(bytes) => {
                for event in parser.feed(&bytes)? {
                    let message = StreamMessage::from_event(&event)?;
                    if let Some(hook) = &inner.config.on_message {
                        hook(&message);
                    }
                    match message {
                        StreamMessage::Next { payload, .. } => shared.next(payload),
                        StreamMessage::Complete { .. } => {
                            shared.complete();
                            return Ok(());
                        }
                        StreamMessage::Pong => {}
                    }
                }
            }
            None => return Err(TransportError::stream_closed()),
        }
    }
}

// ============================================================================
// Single-connection mode
// ============================================================================

enum Command {
    Subscribe {
        key: String,
        request: OperationRequest,
        shared: Arc<SharedSink>,
    },
    Dispose {
        key: String,
    },
    SubmitFailed {
        wire_id: String,
        error: TransportError,
    },
    Shutdown,
}

struct SubEntry {
    /// Stable handle the disposer addresses; survives reconnects.
    key: String,
    request: OperationRequest,
    shared: Arc<SharedSink>,
}

struct ConnState {
    config: ClientConfig,
    endpoint: Endpoint,
    commands_weak: mpsc::WeakUnboundedSender<Command>,
    /// Live subscriptions, keyed by their current wire id.
    subs: HashMap<String, SubEntry>,
    retries: u32,
}

/// Owns the single-connection lifecycle: handshake, demultiplexing,
/// submission, cancellation, reconnects.
async fn run_single_connection(
    config: ClientConfig,
    endpoint: Endpoint,
    commands_weak: mpsc::WeakUnboundedSender<Command>,
    mut commands: mpsc::UnboundedReceiver<Command>,
) {
    let lazy = config.lazy;
    let mut state = ConnState {
        config,
        endpoint,
        commands_weak,
        subs: HashMap::new(),
        retries: 0,
    };

    loop {
        if lazy && state.subs.is_empty() {
            state.retries = 0;
            if !wait_for_work(&mut state, &mut commands).await {
                return;
            }
        }

        let (token, mut stream) = match handshake(&state.config, &state.endpoint).await {
            Ok(pair) => pair,
            Err(err) => {
                if !backoff(&mut state, err).await {
                    // Gave up; sinks are failed. Block until new work.
                    if !wait_for_work(&mut state, &mut commands).await {
                        return;
                    }
                }
                continue;
            }
        };
        state.retries = 0;

        // The previous reservation is gone, so every surviving
        // subscription is re-issued under a fresh id.
        resubmit_all(&mut state, &token);

        let mut parser = SseParser::new();
        let mut failure: Option<TransportError> = None;
        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    None => return,
                    Some(Command::Shutdown) => {
                        fail_all(&mut state, TransportError::disposed());
                        return;
                    }
                    Some(Command::Subscribe { key, request, shared }) => {
                        state.subs.insert(key.clone(), SubEntry {
                            key: key.clone(),
                            request: request.clone(),
                            shared,
                        });
                        submit(&state, &token, key, request);
                    }
                    Some(Command::Dispose { key }) => {
                        if let Some(wire_id) = wire_id_for_key(&state, &key) {
                            state.subs.remove(&wire_id);
                            spawn_delete(
                                state.config.clone(),
                                state.endpoint.clone(),
                                token.clone(),
                                wire_id,
                            );
                        }
                        if lazy && state.subs.is_empty() {
                            break;
                        }
                    }
                    Some(Command::SubmitFailed { wire_id, error }) => {
                        if let Some(entry) = state.subs.remove(&wire_id) {
                            entry.shared.error(error);
                        }
                        if lazy && state.subs.is_empty() {
                            break;
                        }
                    }
                },
                chunk = stream.next_chunk() => match chunk {
                    Ok(Some(bytes)) => {
                        if let Err(err) = dispatch_chunk(&mut state, &mut parser, &bytes) {
                            failure = Some(err);
                            break;
                        }
                        if lazy && state.subs.is_empty() {
                            break;
                        }
                    }
                    Ok(None) => {
                        failure = Some(TransportError::stream_closed());
                        break;
                    }
                    Err(err) => {
                        failure = Some(err);
                        break;
                    }
                },
            }
        }

        // Dropping the stream closes the connection; the server cancels
        // whatever the reservation still holds.
        drop(stream);
        if let Some(err) = failure {
            if lazy && state.subs.is_empty() {
                continue;
            }
            if !backoff(&mut state, err).await {
                // Gave up; block until new work arrives.
                if !wait_for_work(&mut state, &mut commands).await {
                    return;
                }
            }
        }
    }
}

/// Processes commands until at least one subscription is wanted.
/// Returns false when the loop should exit.
async fn wait_for_work(
    state: &mut ConnState,
    commands: &mut mpsc::UnboundedReceiver<Command>,
) -> bool {
    while state.subs.is_empty() {
        match commands.recv().await {
            None => return false,
            Some(Command::Shutdown) => {
                fail_all(state, TransportError::disposed());
                return false;
            }
            Some(Command::Subscribe {
                key,
                request,
                shared,
            }) => {
                state.subs.insert(
                    key.clone(),
                    SubEntry {
                        key,
                        request,
                        shared,
                    },
                );
            }
            Some(Command::Dispose { key }) => {
                if let Some(wire_id) = wire_id_for_key(state, &key) {
                    state.subs.remove(&wire_id);
                }
            }
            Some(Command::SubmitFailed { wire_id, error }) => {
                if let Some(entry) = state.subs.remove(&wire_id) {
                    entry.shared.error(error);
                }
            }
        }
    }
    true
}

/// Waits before the next attempt after a retryable failure; fails every
/// sink and returns false once the budget is spent or the error is
/// terminal.
async fn backoff(state: &mut ConnState, err: TransportError) -> bool {
    if !err.is_retryable() {
        fail_all(state, err);
        return false;
    }
    if state.retries >= state.config.retry_attempts {
        fail_all(state, TransportError::retries_exhausted(state.retries + 1));
        return false;
    }
    debug!(error = %err, retries = state.retries, "event stream lost, retrying");
    (state.config.retry_wait_fn())(state.retries).await;
    state.retries += 1;
    true
}

fn fail_all(state: &mut ConnState, err: TransportError) {
    if state.subs.is_empty() && !state.config.lazy {
        if let Some(handler) = &state.config.on_non_lazy_error {
            handler(err.clone());
        }
    }
    for (_, entry) in state.subs.drain() {
        entry.shared.error(err.clone());
    }
    state.retries = 0;
}

fn wire_id_for_key(state: &ConnState, key: &str) -> Option<String> {
    state
        .subs
        .iter()
        .find(|(_, entry)| entry.key == key)
        .map(|(wire_id, _)| wire_id.clone())
}

/// `PUT` for a token, then `GET` to open the event stream.
async fn handshake(
    config: &ClientConfig,
    endpoint: &Endpoint,
) -> TransportResult<(String, EventStreamConn)> {
    let headers = config.resolve_headers().await;
    let request = build_request(endpoint, &headers, Method::PUT, &endpoint.path, None, None, None)?;
    let (response, _conn) = send_request(endpoint, config, request).await?;
    let status = response.status();
    if status != StatusCode::OK {
        return Err(status_error(status));
    }
    let token_bytes = response
        .into_body()
        .collect()
        .await
        .map_err(|e| TransportError::network(format!("reading token failed: {}", e)))?
        .to_bytes();
    let token = String::from_utf8_lossy(&token_bytes).trim().to_string();
    if token.is_empty() {
        return Err(TransportError::parse("empty stream token"));
    }

    let request = build_request(
        endpoint,
        &headers,
        Method::GET,
        &endpoint.path,
        Some(&token),
        Some("text/event-stream"),
        None,
    )?;
    let (response, conn) = send_request(endpoint, config, request).await?;
    let status = response.status();
    if status != StatusCode::OK {
        return Err(status_error(status));
    }
    let content_type = response
        .headers()
        .get("content-type")
        .and_then(|value| value.to_str().ok())
        .unwrap_or("");
    if !content_type.contains("text/event-stream") {
        return Err(TransportError::parse(format!(
            "unexpected content-type: {}",
            content_type
        )));
    }

    debug!(token = %token, "event stream established");
    Ok((
        token,
        EventStreamConn {
            body: response.into_body(),
            conn,
        },
    ))
}

/// Re-issues every live subscription under a fresh wire id.
fn resubmit_all(state: &mut ConnState, token: &str) {
    let generate_id = state.config.generate_id_fn();
    let entries: Vec<SubEntry> = state.subs.drain().map(|(_, entry)| entry).collect();
    for entry in entries {
        let wire_id = generate_id();
        state.subs.insert(
            wire_id.clone(),
            SubEntry {
                key: entry.key.clone(),
                request: entry.request.clone(),
                shared: entry.shared.clone(),
            },
        );
        submit(state, token, wire_id, entry.request);
    }
}

/// `POST`s one operation on its own connection; reports failures back
/// into the command loop so the sink is errored and unregistered.
fn submit(state: &ConnState, token: &str, wire_id: String, request: OperationRequest) {
    let config = state.config.clone();
    let endpoint = state.endpoint.clone();
    let commands = state.commands_weak.clone();
    let token = token.to_string();
    tokio::spawn(async move {
        let request = request.with_operation_id(wire_id.clone());
        let result = async {
            let body = serde_json::to_vec(&request)
                .map_err(|e| TransportError::serialize(e.to_string()))?;
            let headers = config.resolve_headers().await;
            let http_request = build_request(
                &endpoint,
                &headers,
                Method::POST,
                &endpoint.path,
                Some(&token),
                None,
                Some(Bytes::from(body)),
            )?;
            let (status, _body) = send_buffered(&endpoint, &config, http_request).await?;
            if status.is_success() {
                Ok(())
            } else {
                Err(status_error(status))
            }
        }
        .await;

        if let Err(error) = result {
            if let Some(commands) = commands.upgrade() {
                let _ = commands.send(Command::SubmitFailed { wire_id, error });
            }
        }
    });
}

/// Fire-and-forget `DELETE` cancelling one operation server-side.
fn spawn_delete(config: ClientConfig, endpoint: Endpoint, token: String, wire_id: String) {
    tokio::spawn(async move {
        let query: String = url::form_urlencoded::Serializer::new(String::new())
            .append_pair("operationId", &wire_id)
            .finish();
        let path = format!("{}?{}", endpoint.path, query);
        let headers = config.resolve_headers().await;
        let request = build_request(
            &endpoint,
            &headers,
            Method::DELETE,
            &path,
            Some(&token),
            None,
            None,
        );
        if let Ok(request) = request {
            let _ = send_buffered(&endpoint, &config, request).await;
        }
    });
}

/// Routes one chunk of stream bytes to the registered sinks.
fn dispatch_chunk(
    state: &mut ConnState,
    parser: &mut SseParser,
    bytes: &[u8],
) -> TransportResult<()> {
    for event in parser.feed(bytes)? {
        let message = StreamMessage::from_event(&event)?;
        if let Some(hook) = &state.config.on_message {
            hook(&message);
        }
        match message {
            StreamMessage::Next { id, payload } => match id {
                Some(id) => {
                    if let Some(entry) = state.subs.get(&id) {
                        entry.shared.next(payload);
                    }
                }
                None => warn!("next event without id on multiplexed stream"),
            },
            StreamMessage::Complete { id } => {
                if let Some(id) = id {
                    if let Some(entry) = state.subs.remove(&id) {
                        entry.shared.complete();
                    }
                }
            }
            StreamMessage::Pong => {}
        }
    }
    Ok(())
}

// ============================================================================
// HTTP plumbing
// ============================================================================

#[derive(Debug, Clone)]
struct Endpoint {
    host: String,
    port: u16,
    path: String,
    authority: String,
}

fn parse_endpoint(raw: &str) -> TransportResult<Endpoint> {
    let url = url::Url::parse(raw)
        .map_err(|e| TransportError::invalid_url(format!("invalid url: {}", e)))?;
    if url.scheme() != "http" {
        return Err(TransportError::invalid_url(
            "only http urls are supported; terminate TLS in front of the endpoint",
        ));
    }
    let host = url
        .host_str()
        .ok_or_else(|| TransportError::invalid_url("url has no host"))?
        .to_string();
    let port = url.port().unwrap_or(80);
    let path = if url.path().is_empty() {
        "/".to_string()
    } else {
        url.path().to_string()
    };
    Ok(Endpoint {
        authority: format!("{}:{}", host, port),
        host,
        port,
        path,
    })
}

fn build_request(
    endpoint: &Endpoint,
    headers: &HashMap<String, String>,
    method: Method,
    path_and_query: &str,
    token: Option<&str>,
    accept: Option<&str>,
    body: Option<Bytes>,
) -> TransportResult<Request<Full<Bytes>>> {
    let mut builder = Request::builder()
        .method(method)
        .uri(path_and_query)
        .header("host", &endpoint.authority);
    for (key, value) in headers {
        builder = builder.header(key, value);
    }
    if let Some(token) = token {
        if !token.is_empty() {
            builder = builder.header(STREAM_TOKEN_HEADER, token);
        }
    }
    if let Some(accept) = accept {
        builder = builder.header("accept", accept);
    }
    let body = match body {
        Some(bytes) => {
            builder = builder.header("content-type", "application/json");
            Full::new(bytes)
        }
        None => Full::new(Bytes::new()),
    };
    builder
        .body(body)
        .map_err(|e| TransportError::internal(format!("building request failed: {}", e)))
}

/// Connects, performs the http1 handshake, and sends one request. The
/// returned task drives the connection for as long as the response body
/// lives.
async fn send_request(
    endpoint: &Endpoint,
    config: &ClientConfig,
    request: Request<Full<Bytes>>,
) -> TransportResult<(hyper::Response<Incoming>, JoinHandle<()>)> {
    let connect = TcpStream::connect((endpoint.host.as_str(), endpoint.port));
    let stream = tokio::time::timeout(config.connect_timeout, connect)
        .await
        .map_err(|_| TransportError::timeout())?
        .map_err(|e| {
            TransportError::new(ErrorCode::ConnectionRefused, format!("connect failed: {}", e))
        })?;

    let io = TokioIo::new(stream);
    let (mut sender, conn) = hyper::client::conn::http1::handshake(io)
        .await
        .map_err(|e| TransportError::network(format!("handshake failed: {}", e)))?;
    let conn = tokio::spawn(async move {
        let _ = conn.await;
    });

    let response = sender
        .send_request(request)
        .await
        .map_err(|e| TransportError::network(format!("request failed: {}", e)))?;
    Ok((response, conn))
}

async fn send_buffered(
    endpoint: &Endpoint,
    config: &ClientConfig,
    request: Request<Full<Bytes>>,
) -> TransportResult<(StatusCode, Bytes)> {
    let (response, _conn) = send_request(endpoint, config, request).await?;
    let status = response.status();
    let body = response
        .into_body()
        .collect()
        .await
        .map_err(|e| TransportError::network(format!("reading response failed: {}", e)))?
        .to_bytes();
    Ok((status, body))
}

/// An open event-stream response; dropping it closes the connection,
/// which is the server's disconnect signal.
struct EventStreamConn {
    body: Incoming,
    conn: JoinHandle<()>,
}

impl EventStreamConn {
    async fn next_chunk(&mut self) -> TransportResult<Option<Bytes>> {
        loop {
            match self.body.frame().await {
                None => return Ok(None),
                Some(Ok(frame)) => {
                    if let Ok(data) = frame.into_data() {
                        return Ok(Some(data));
                    }
                    // trailers: skip
                }
                Some(Err(e)) => {
                    return Err(TransportError::network(format!("stream read failed: {}", e)))
                }
            }
        }
    }
}

impl Drop for EventStreamConn {
    fn drop(&mut self) {
        self.conn.abort();
    }
}

fn status_error(status: StatusCode) -> TransportError {
    let code = if status.is_server_error() {
        ErrorCode::ServerError
    } else {
        match status.as_u16() {
            401 => ErrorCode::Unauthorized,
            404 => ErrorCode::NotFound,
            405 => ErrorCode::MethodNotAllowed,
            409 => ErrorCode::Conflict,
            _ => ErrorCode::BadRequest,
        }
    };
    TransportError::new(code, format!("server responded {}", status))
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NullSink;

    impl Sink for NullSink {
        fn next(&self, _result: ExecutionResult) {}
        fn error(&self, _error: TransportError) {}
        fn complete(&self) {}
    }

    #[test]
    fn test_client_config() {
        let config = ClientConfig::new("http://localhost:4000/graphql/stream")
            .single_connection()
            .lazy(false)
            .retry_attempts(3)
            .connect_timeout(Duration::from_secs(5))
            .header("authorization", "Bearer token");

        assert!(config.single_connection);
        assert!(!config.lazy);
        assert_eq!(config.retry_attempts, 3);
        assert_eq!(config.connect_timeout, Duration::from_secs(5));
        assert_eq!(
            config.headers.get("authorization"),
            Some(&"Bearer token".to_string())
        );
    }

    #[test]
    fn test_parse_endpoint() {
        let endpoint = parse_endpoint("http://localhost:4000/graphql/stream").unwrap();
        assert_eq!(endpoint.host, "localhost");
        assert_eq!(endpoint.port, 4000);
        assert_eq!(endpoint.path, "/graphql/stream");
        assert_eq!(endpoint.authority, "localhost:4000");

        let endpoint = parse_endpoint("http://example.com").unwrap();
        assert_eq!(endpoint.port, 80);
        assert_eq!(endpoint.path, "/");

        assert!(parse_endpoint("https://example.com").is_err());
        assert!(parse_endpoint("not a url").is_err());
    }

    #[test]
    fn test_shared_sink_terminates_once() {
        struct CountingSink {
            completes: Arc<AtomicBool>,
        }
        impl Sink for CountingSink {
            fn next(&self, _result: ExecutionResult) {}
            fn error(&self, _error: TransportError) {
                panic!("error after complete");
            }
            fn complete(&self) {
                assert!(!self.completes.swap(true, Ordering::SeqCst));
            }
        }

        let completes = Arc::new(AtomicBool::new(false));
        let shared = SharedSink::new(CountingSink {
            completes: completes.clone(),
        });
        shared.complete();
        shared.complete();
        shared.error(TransportError::disposed());
        assert!(completes.load(Ordering::SeqCst));
    }

    #[test]
    fn test_shared_sink_silent_after_dispose() {
        struct PanickingSink;
        impl Sink for PanickingSink {
            fn next(&self, _result: ExecutionResult) {
                panic!("next after dispose");
            }
            fn error(&self, _error: TransportError) {
                panic!("error after dispose");
            }
            fn complete(&self) {
                panic!("complete after dispose");
            }
        }

        let shared = SharedSink::new(PanickingSink);
        shared.dispose();
        shared.next(ExecutionResult::default());
        shared.error(TransportError::disposed());
        shared.complete();
    }

    #[test]
    fn test_disposer_is_idempotent() {
        let count = Arc::new(std::sync::atomic::AtomicU32::new(0));
        let counted = count.clone();
        let disposer = Disposer::new(move || {
            counted.fetch_add(1, Ordering::SeqCst);
        });
        disposer.dispose();
        disposer.dispose();
        disposer.clone().dispose();
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_jitter_stays_in_bounds() {
        for _ in 0..64 {
            assert!(jitter(3000) < 3000);
        }
    }

    #[test]
    fn test_default_ids_are_unique() {
        let generate = ClientConfig::new("http://localhost/").generate_id_fn();
        let a = generate();
        let b = generate();
        assert_ne!(a, b);
        assert!(!a.is_empty());
    }

    #[tokio::test]
    async fn test_dynamic_headers_merge_over_static() {
        let config = ClientConfig::new("http://localhost/")
            .header("x-static", "a")
            .header("x-both", "static")
            .dynamic_headers(|| async {
                HashMap::from([
                    ("x-dynamic".to_string(), "b".to_string()),
                    ("x-both".to_string(), "dynamic".to_string()),
                ])
            });

        let headers = config.resolve_headers().await;
        assert_eq!(headers["x-static"], "a");
        assert_eq!(headers["x-dynamic"], "b");
        assert_eq!(headers["x-both"], "dynamic");
    }

    #[tokio::test]
    async fn test_subscribe_after_dispose_fails() {
        let client = Client::new("http://localhost:1/graphql/stream").unwrap();
        client.dispose();
        let err = client
            .subscribe(OperationRequest::new("{ hello }"), NullSink)
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::Disposed);
    }
}
