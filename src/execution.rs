//! The seam between the transport and GraphQL execution.
//!
//! Schema construction, parsing, validation and execution live outside
//! this crate: the host implements [`GraphqlEngine`] on top of whatever
//! GraphQL engine it uses, and the transport forwards the results it
//! yields without looking inside them.

use crate::protocol::{ExecutionResult, GraphqlError, OperationRequest};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use tokio::sync::mpsc;

/// Per-request data handed to the engine and to server hooks.
#[derive(Debug, Clone, Default)]
pub struct RequestContext {
    /// Request method, uppercase.
    pub method: String,
    /// Request headers, names lowercased.
    pub headers: HashMap<String, String>,
    /// The authenticated stream token; empty in distinct mode.
    pub token: String,
    /// Opaque value produced by the server's `context` option.
    pub context_value: Option<Value>,
}

impl RequestContext {
    /// Gets a header value.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(&name.to_ascii_lowercase()).map(|s| s.as_str())
    }
}

/// What one accepted operation executes as.
pub enum ExecutionOutcome {
    /// A query or mutation: exactly one result.
    Single(ExecutionResult),
    /// A subscription: a lazy sequence of results.
    Stream(ResultStream),
}

/// Host-provided GraphQL execution.
///
/// `run` classifies the operation and executes it. Parse and validation
/// failures are returned as `Err`; the server delivers them as a `400`
/// in distinct mode or in-band (`next` carrying errors, then `complete`)
/// in single-connection mode. Execution-level errors inside a result
/// travel in the result itself.
#[async_trait]
pub trait GraphqlEngine: Send + Sync + 'static {
    async fn run(
        &self,
        ctx: &RequestContext,
        request: OperationRequest,
    ) -> Result<ExecutionOutcome, Vec<GraphqlError>>;
}

/// Error when sending into a [`ResultStream`] whose consumer is gone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendError {
    /// The receiver has been dropped.
    Closed,
}

impl std::fmt::Display for SendError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SendError::Closed => write!(f, "result stream closed"),
        }
    }
}

impl std::error::Error for SendError {}

/// A subscription's sequence of results.
///
/// Backed by a bounded channel: the transport pulls one value, forwards
/// it, and only then pulls the next, so a slow consumer paces the
/// producer. Dropping the stream is the cancellation path; the producer
/// observes the closed channel and runs its cleanup.
pub struct ResultStream {
    receiver: mpsc::Receiver<Result<ExecutionResult, GraphqlError>>,
    done: bool,
}

impl ResultStream {
    /// Creates a stream and its producer handle.
    pub fn channel(buffer: usize) -> (Self, ResultSender) {
        let (sender, receiver) = mpsc::channel(buffer);
        (
            Self {
                receiver,
                done: false,
            },
            ResultSender { sender },
        )
    }

    /// Receives the next result. `None` means normal termination;
    /// `Some(Err(..))` is a terminal producer failure.
    pub async fn next(&mut self) -> Option<Result<ExecutionResult, GraphqlError>> {
        if self.done {
            return None;
        }
        match self.receiver.recv().await {
            Some(Err(error)) => {
                self.done = true;
                Some(Err(error))
            }
            Some(item) => Some(item),
            None => {
                self.done = true;
                None
            }
        }
    }
}

/// Producer handle for a [`ResultStream`].
#[derive(Clone)]
pub struct ResultSender {
    sender: mpsc::Sender<Result<ExecutionResult, GraphqlError>>,
}

impl ResultSender {
    /// Sends one result. Completion is signaled by dropping every sender.
    pub async fn send(&self, result: ExecutionResult) -> Result<(), SendError> {
        self.sender
            .send(Ok(result))
            .await
            .map_err(|_| SendError::Closed)
    }

    /// Terminates the stream with a producer error.
    pub async fn fail(&self, error: GraphqlError) -> Result<(), SendError> {
        self.sender
            .send(Err(error))
            .await
            .map_err(|_| SendError::Closed)
    }

    /// Returns true once the consumer has cancelled.
    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }

    /// Resolves once the consumer has cancelled.
    pub async fn closed(&self) {
        self.sender.closed().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_stream_delivers_in_order_then_completes() {
        let (mut stream, sender) = ResultStream::channel(4);
        tokio::spawn(async move {
            for i in 0..3 {
                sender
                    .send(ExecutionResult::data(json!({"i": i})))
                    .await
                    .unwrap();
            }
        });

        for i in 0..3 {
            let result = stream.next().await.unwrap().unwrap();
            assert_eq!(result.data, Some(json!({"i": i})));
        }
        assert!(stream.next().await.is_none());
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn test_producer_error_is_terminal() {
        let (mut stream, sender) = ResultStream::channel(4);
        sender.fail(GraphqlError::new("boom")).await.unwrap();

        let item = stream.next().await.unwrap();
        assert_eq!(item.unwrap_err().message, "boom");
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn test_dropping_stream_closes_producer() {
        let (stream, sender) = ResultStream::channel(1);
        assert!(!sender.is_closed());
        drop(stream);
        sender.closed().await;
        assert!(sender
            .send(ExecutionResult::default())
            .await
            .is_err());
    }
}
