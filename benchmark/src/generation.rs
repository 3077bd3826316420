//! Load generation for the `Process` RPC: one simulated client per worker,
//! each issuing a fixed number of sequential `Process` calls of a given
//! payload size and reporting per-call latency, adapted from this
//! codebase's own prefill/decode load generator to the simpler unary RPC
//! of this system.

use std::time::{Duration, Instant};

use batching_proto::batching_client::BatchingClient;
use batching_proto::{ConnectionRequest, TensorMessage};
use tokio::sync::mpsc;
use tonic::transport::Channel;

#[derive(Debug, Clone)]
pub(crate) struct CallResult {
    pub(crate) latency: Duration,
}

#[derive(Debug)]
pub(crate) enum Message {
    Call(Result<CallResult, tonic::Status>),
    WorkerDone,
}

/// Runs one simulated client: connects once, then issues `n_calls`
/// sequential `Process` calls of `payload_size` floats, reporting each
/// call's outcome on `sender`.
pub(crate) async fn worker_task(
    channel: Channel,
    worker_id: usize,
    n_calls: usize,
    payload_size: usize,
    sender: mpsc::Sender<Message>,
) {
    let mut client = BatchingClient::new(channel);

    let client_id = match client.connect(ConnectionRequest {}).await {
        Ok(reply) => reply.into_inner().client_id,
        Err(status) => {
            tracing::error!(worker_id, %status, "failed to connect worker");
            let _ = sender.send(Message::WorkerDone).await;
            return;
        }
    };

    let payload = vec![1.0f32; payload_size];

    for _ in 0..n_calls {
        let start = Instant::now();
        let outcome = client
            .process(TensorMessage {
                client_id: client_id.clone(),
                n: payload_size as u32,
                k: 0,
                nr: 0,
                nc: 0,
                buffer: payload.clone(),
                serialized_buffer: vec![],
            })
            .await;

        let message = match outcome {
            Ok(_) => Message::Call(Ok(CallResult {
                latency: start.elapsed(),
            })),
            Err(status) => Message::Call(Err(status)),
        };
        if sender.send(message).await.is_err() {
            return;
        }
    }

    let _ = sender.send(Message::WorkerDone).await;
}
