//! Core batching engine and gRPC façade.
//!
//! [`batcher::Batcher`] is the concurrency core: admission, capacity
//! management, dispatch to a bound [`backend::Backend`], and per-client
//! result rendezvous. [`session::SessionRegistry`] tracks live client
//! identities. [`service::BatchingService`] is the thin tonic-facing
//! translation between the two and the wire protocol in `batching-proto`.
//! [`serve`] owns the transport lifecycle (start/stop, optional TLS).

pub mod backend;
pub mod batcher;
pub mod error;
pub mod serve;
pub mod service;
pub mod session;
pub mod telemetry;
pub mod wire;

pub use backend::{Backend, BindSource, Payload};
pub use batcher::{BatchRequest, Batcher};
pub use error::{BackendError, BatcherError, ReturnCode, RouterError};
pub use serve::{ServerHandle, TlsMaterial};
pub use service::BatchingService;
pub use session::SessionRegistry;
