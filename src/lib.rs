//! Streaming GraphQL transport over Server-Sent Events.
//!
//! This crate is the two-sided runtime for a GraphQL transport layered
//! on SSE: a server engine that executes queries, mutations and
//! subscriptions and emits their results as an event stream, and a
//! client that opens such streams and surfaces results per operation.
//! It operates cleanly over HTTP/1.1 and survives abrupt disconnects in
//! two interoperating modes: one stream per operation ("distinct
//! connections") and one multiplexed stream per client ("single
//! connection", reserved out-of-band with a stream token).
//!
//! GraphQL execution itself is external: implement [`GraphqlEngine`] on
//! top of your GraphQL library and the transport forwards whatever it
//! yields, byte-exactly.
//!
//! # Server
//!
//! ```ignore
//! use graphql_sse::{SseServer, GraphqlEngine};
//!
//! let server = SseServer::builder(MyEngine::new(schema)).build();
//! server.listen("127.0.0.1:4000".parse()?).await?;
//! ```
//!
//! # Client
//!
//! ```ignore
//! use graphql_sse::{Client, ClientConfig, OperationRequest};
//!
//! let client = Client::with_config(
//!     ClientConfig::new("http://localhost:4000/graphql/stream").single_connection(),
//! )?;
//! let mut greetings = client.iterate(OperationRequest::new("subscription { greetings }"))?;
//! while let Some(result) = greetings.next().await {
//!     println!("{:?}", result?);
//! }
//! ```

pub mod client;
pub mod error;
pub mod execution;
pub mod http;
pub mod protocol;
pub mod pubsub;
pub mod registry;
pub mod server;
pub mod sse;

// Client re-exports
pub use client::{Client, ClientConfig, Disposer, Sink, Subscription};

// Server re-exports
pub use server::{
    AuthOutcome, ResponseOverride, ServerConfig, SseServer, SseServerBuilder, SubscribeOutcome,
};

// Execution seam re-exports
pub use execution::{
    ExecutionOutcome, GraphqlEngine, RequestContext, ResultSender, ResultStream, SendError,
};

// Protocol re-exports
pub use protocol::{
    ExecutionResult, GraphqlError, OperationRequest, StreamMessage, OPERATION_ID_EXTENSION,
    PERSISTED_QUERY_EXTENSION, STREAM_TOKEN_HEADER,
};

// Errors
pub use error::{ErrorCode, TransportError, TransportResult};

// PubSub re-exports
pub use pubsub::PubSub;
