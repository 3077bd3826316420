use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use batching_proto::batching_server::Batching;
use batching_proto::{AdminReply, AdminRequest, ConnectionReply, ConnectionRequest, TensorMessage};
use tonic::{Request, Response, Status};
use tracing::{instrument, warn};

use crate::backend::Payload;
use crate::batcher::{BatchRequest, Batcher};
use crate::error::{BatcherError, ReturnCode, RouterError};
use crate::session::SessionRegistry;
use crate::wire::{join_items, split_items};

/// The gRPC-facing implementation of the three batching RPCs. Holds no
/// batching logic of its own; every call is a thin translation between
/// wire messages and the blocking `Batcher`/`SessionRegistry` core.
pub struct BatchingService {
    batcher: Arc<Batcher>,
    sessions: Arc<SessionRegistry>,
}

impl BatchingService {
    pub fn new(batcher: Arc<Batcher>, sessions: Arc<SessionRegistry>) -> Self {
        Self { batcher, sessions }
    }
}

/// Sets a shared cancellation flag when dropped without being disarmed.
/// Wraps the blocking `GetResult` wait: if the enclosing RPC future is
/// dropped (client cancellation, deadline), the blocking worker thread
/// observes the flag and returns without consuming the result slot.
struct CancelOnDrop(Arc<AtomicBool>);

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        self.0.store(true, Ordering::Release);
    }
}

fn map_batcher_error(err: BatcherError) -> Status {
    let error_type = err.error_type();
    metrics::counter!("batching_grpc_errors_total", "error_type" => error_type).increment(1);
    warn!(error_type, error = %err, "request failed");
    match err.code() {
        ReturnCode::NeedBindCall => Status::failed_precondition(err.to_string()),
        ReturnCode::ShapeIncorrect | ReturnCode::BatchTooLarge => {
            Status::invalid_argument(err.to_string())
        }
        ReturnCode::NextBatch => Status::unavailable(err.to_string()),
        ReturnCode::AlreadyBound | ReturnCode::NoSuitableBindArgs | ReturnCode::Internal => {
            Status::cancelled(err.to_string())
        }
        ReturnCode::Ok => unreachable!("Ok is not an error"),
    }
}

fn map_router_error(err: RouterError) -> Status {
    if let RouterError::Batcher(inner) = err {
        return map_batcher_error(inner);
    }
    let error_type = err.error_type();
    metrics::counter!("batching_grpc_errors_total", "error_type" => error_type).increment(1);
    warn!(error_type, error = %err, "request failed");
    match err {
        RouterError::UnknownClient => Status::failed_precondition("unknown client id"),
        RouterError::Malformed(msg) => Status::invalid_argument(msg),
        RouterError::Batcher(_) => unreachable!("handled above"),
    }
}

#[tonic::async_trait]
impl Batching for BatchingService {
    #[instrument(skip(self, _request))]
    async fn connect(
        &self,
        _request: Request<ConnectionRequest>,
    ) -> Result<Response<ConnectionReply>, Status> {
        let client_id = self.sessions.connect();
        metrics::counter!("batching_connect_total").increment(1);
        Ok(Response::new(ConnectionReply { client_id }))
    }

    #[instrument(skip(self, request))]
    async fn set_batch_size(
        &self,
        request: Request<AdminRequest>,
    ) -> Result<Response<AdminReply>, Status> {
        let new_size = request.into_inner().new_batch_size as usize;
        let batcher = Arc::clone(&self.batcher);
        tokio::task::spawn_blocking(move || batcher.set_batch_size(new_size))
            .await
            .map_err(|err| Status::internal(format!("batching worker panicked: {err}")))?
            .map_err(map_batcher_error)?;
        Ok(Response::new(AdminReply {}))
    }

    #[instrument(skip(self, request), fields(client_id = %request.get_ref().client_id))]
    async fn process(
        &self,
        request: Request<TensorMessage>,
    ) -> Result<Response<TensorMessage>, Status> {
        let message = request.into_inner();
        let client_id = message.client_id.clone();

        if !self.sessions.is_known(&client_id) {
            return Err(map_router_error(RouterError::UnknownClient));
        }

        let shape = if (message.k | message.nr | message.nc) == 0 {
            None
        } else {
            Some((message.k, message.nr, message.nc))
        };
        let items = split_items(&message).map_err(map_router_error)?;

        let batcher = Arc::clone(&self.batcher);
        let add_client_id = client_id.clone();
        tokio::task::spawn_blocking(move || {
            batcher.add_to_batch(BatchRequest {
                client_id: add_client_id,
                items,
                shape,
            })
        })
        .await
        .map_err(|err| Status::internal(format!("batching worker panicked: {err}")))?
        .map_err(map_batcher_error)?;

        let cancel = Arc::new(AtomicBool::new(false));
        // Dropped when this future is cancelled mid-await (e.g. the client
        // disconnects) or once the blocking wait below completes normally.
        let _guard = CancelOnDrop(Arc::clone(&cancel));

        let batcher = Arc::clone(&self.batcher);
        let result_client_id = client_id.clone();
        let outcome: Option<Result<Vec<Payload>, BatcherError>> =
            tokio::task::spawn_blocking(move || batcher.get_result(&result_client_id, &cancel))
                .await
                .map_err(|err| Status::internal(format!("batching worker panicked: {err}")))?;

        match outcome {
            Some(Ok(items)) => {
                let response = join_items(client_id, items).map_err(map_router_error)?;
                Ok(Response::new(response))
            }
            Some(Err(err)) => Err(map_batcher_error(err)),
            None => Err(Status::cancelled("request cancelled before a result was available")),
        }
    }
}
