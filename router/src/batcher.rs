use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Condvar, Mutex};
use std::time::Duration;

use tracing::{info, instrument, warn};

use crate::backend::{Backend, BindSource, Payload};
use crate::error::BatcherError;

/// How long a `GetResult` wait sleeps between checks of the cancellation
/// flag. Spurious wakeups on the condition are harmless; this bound just
/// caps how long a cancelled caller can remain blocked.
const CANCEL_POLL_INTERVAL: Duration = Duration::from_millis(50);

struct BatchState {
    bound: bool,
    backend: Option<Box<dyn Backend>>,
    declared_shape: Option<(u32, u32, u32)>,
    capacity: usize,
    items: Vec<Payload>,
    /// client id -> half-open [lo, hi) slice into `items`, in admission order.
    slices: HashMap<String, (usize, usize)>,
}

struct ResultState {
    /// client id -> outcome of its most recent dispatched batch. `Err`
    /// carries a backend failure, woken the same way as a success.
    results: HashMap<String, Result<Vec<Payload>, String>>,
    done: HashSet<String>,
}

/// The shared batching core: admits items from concurrently-calling
/// clients, triggers execution against the bound backend once the batch
/// fills (or would overflow), and routes each client's slice of the
/// output back to it.
///
/// Two locks guard disjoint state and are always acquired in this order:
/// the batch lock (`batch`, admission + dispatch) before the result lock
/// (`result`, the done-set and condition clients wait on).
pub struct Batcher {
    batch: Mutex<BatchState>,
    result: Mutex<ResultState>,
    cond: Condvar,
}

/// One client's contribution to a batch: already split into per-item
/// payloads by the wire layer.
pub struct BatchRequest {
    pub client_id: String,
    pub items: Vec<Payload>,
    pub shape: Option<(u32, u32, u32)>,
}

impl Batcher {
    pub fn new(initial_capacity: usize) -> Self {
        Self {
            batch: Mutex::new(BatchState {
                bound: false,
                backend: None,
                declared_shape: None,
                capacity: initial_capacity,
                items: Vec::new(),
                slices: HashMap::new(),
            }),
            result: Mutex::new(ResultState {
                results: HashMap::new(),
                done: HashSet::new(),
            }),
            cond: Condvar::new(),
        }
    }

    #[instrument(skip(self, source))]
    pub fn bind(&self, source: BindSource) -> Result<(), BatcherError> {
        let mut guard = self.batch.lock().unwrap_or_else(|e| e.into_inner());
        if guard.bound {
            warn!("bind rejected: batcher is already bound to a backend");
            return Err(BatcherError::AlreadyBound);
        }
        let backend = match source.resolve() {
            Ok(backend) => backend,
            Err(err) => {
                warn!(error = %err, "bind rejected: binding descriptor could not be resolved");
                return Err(err);
            }
        };
        guard.declared_shape = backend.declared_shape();
        guard.backend = Some(backend);
        guard.bound = true;
        metrics::gauge!("batching_capacity").set(guard.capacity as f64);
        info!(capacity = guard.capacity, "backend bound");
        Ok(())
    }

    #[instrument(skip(self))]
    pub fn set_batch_size(&self, new_size: usize) -> Result<(), BatcherError> {
        let mut guard = self.batch.lock().unwrap_or_else(|e| e.into_inner());
        if new_size <= guard.items.len() {
            warn!(
                new_size,
                current_fill = guard.items.len(),
                "set_batch_size rejected: new size does not exceed current fill"
            );
            return Err(BatcherError::NextBatch);
        }
        guard.capacity = new_size;
        metrics::gauge!("batching_capacity").set(guard.capacity as f64);
        info!(capacity = guard.capacity, "batch capacity changed");
        Ok(())
    }

    #[instrument(skip(self, request), fields(client_id = %request.client_id, n = request.items.len()))]
    pub fn add_to_batch(&self, request: BatchRequest) -> Result<(), BatcherError> {
        let BatchRequest {
            client_id,
            items,
            shape,
        } = request;
        let n = items.len();

        let mut guard = self.batch.lock().unwrap_or_else(|e| e.into_inner());

        if !guard.bound {
            warn!("add_to_batch rejected: batcher has no bound backend yet");
            metrics::counter!("batching_rejected_total", "reason" => "need_bind_call")
                .increment(1);
            return Err(BatcherError::NeedBindCall);
        }
        if n > guard.capacity {
            warn!(
                requested = n,
                capacity = guard.capacity,
                "add_to_batch rejected: request too large for batch capacity"
            );
            metrics::counter!("batching_rejected_total", "reason" => "batch_too_large")
                .increment(1);
            return Err(BatcherError::BatchTooLarge {
                requested: n,
                capacity: guard.capacity,
            });
        }
        if let (Some(wanted), Some(got)) = (guard.declared_shape, shape) {
            if wanted != got {
                warn!(
                    ?wanted,
                    ?got,
                    "add_to_batch rejected: request shape does not match declared input shape"
                );
                metrics::counter!("batching_rejected_total", "reason" => "shape_incorrect")
                    .increment(1);
                return Err(BatcherError::ShapeIncorrect);
            }
        }

        let current_n = guard.items.len();
        if current_n + n > guard.capacity {
            let capacity_before = guard.capacity;
            guard.capacity = current_n;
            if current_n > 0 {
                self.dispatch_locked(&mut guard);
            }
            warn!(
                requested = n,
                current_n,
                capacity = capacity_before,
                "add_to_batch rejected: batch would overflow, dispatching early and asking caller to retry"
            );
            metrics::counter!("batching_rejected_total", "reason" => "next_batch").increment(1);
            return Err(BatcherError::NextBatch);
        }

        self.clear_stale_result(&client_id);

        let lo = guard.items.len();
        guard.items.extend(items);
        let hi = guard.items.len();
        guard
            .slices
            .entry(client_id)
            .and_modify(|range| range.1 = hi)
            .or_insert((lo, hi));

        metrics::gauge!("batching_fill").set(guard.items.len() as f64);

        if guard.items.len() == guard.capacity {
            self.dispatch_locked(&mut guard);
        }
        Ok(())
    }

    /// Blocks until `client_id`'s slice of some dispatched batch is ready.
    /// Returns `None` if `cancel` is observed set before a result arrives;
    /// in that case the result slot (if later produced) is left in place
    /// for a future call, not consumed here.
    #[instrument(skip(self, cancel), fields(client_id = client_id))]
    pub fn get_result(
        &self,
        client_id: &str,
        cancel: &AtomicBool,
    ) -> Option<Result<Vec<Payload>, BatcherError>> {
        let mut guard = self.result.lock().unwrap_or_else(|e| e.into_inner());
        loop {
            if guard.done.remove(client_id) {
                let outcome = guard
                    .results
                    .remove(client_id)
                    .expect("done set membership implies a result slot exists");
                return Some(outcome.map_err(BatcherError::Internal));
            }
            if cancel.load(Ordering::Acquire) {
                return None;
            }
            let (g, _timed_out) = self
                .cond
                .wait_timeout(guard, CANCEL_POLL_INTERVAL)
                .unwrap_or_else(|e| e.into_inner());
            guard = g;
        }
    }

    fn clear_stale_result(&self, client_id: &str) {
        let mut result_guard = self.result.lock().unwrap_or_else(|e| e.into_inner());
        result_guard.done.remove(client_id);
        result_guard.results.remove(client_id);
    }

    /// Runs the backend over the current batch and publishes per-client
    /// results. Called with the batch lock already held; acquires the
    /// result lock itself, preserving the batch-then-result order.
    fn dispatch_locked(&self, guard: &mut BatchState) {
        let frozen_items = std::mem::take(&mut guard.items);
        let frozen_slices = std::mem::take(&mut guard.slices);
        let dispatched_n = frozen_items.len();

        let outcome = match guard.backend.as_ref() {
            Some(backend) => backend.run(frozen_items),
            None => Err(crate::error::BackendError::ExecutionFailed(
                "dispatch triggered without a bound backend".into(),
            )),
        };

        let mut result_guard = self.result.lock().unwrap_or_else(|e| e.into_inner());
        match outcome {
            Ok(outputs) if outputs.len() == dispatched_n => {
                for (client, (lo, hi)) in frozen_slices {
                    result_guard.results.insert(client.clone(), Ok(outputs[lo..hi].to_vec()));
                    result_guard.done.insert(client);
                }
                metrics::counter!("batching_dispatch_total", "outcome" => "success").increment(1);
                metrics::histogram!("batching_dispatch_size").record(dispatched_n as f64);
            }
            Ok(outputs) => {
                let err = crate::error::BackendError::OutputLengthMismatch {
                    expected: dispatched_n,
                    got: outputs.len(),
                };
                warn!(error = %err, "backend returned mismatched output length; failing batch");
                self.fail_all(&mut result_guard, frozen_slices, &err.to_string());
            }
            Err(err) => {
                warn!(error = %err, "backend failed while executing batch");
                self.fail_all(&mut result_guard, frozen_slices, &err.to_string());
            }
        }
        guard.items = Vec::new();
        guard.slices = HashMap::new();
        metrics::gauge!("batching_fill").set(0.0);
        self.cond.notify_all();
    }

    fn fail_all(
        &self,
        result_guard: &mut ResultState,
        slices: HashMap<String, (usize, usize)>,
        message: &str,
    ) {
        for client in slices.into_keys() {
            result_guard
                .results
                .insert(client.clone(), Err(message.to_string()));
            result_guard.done.insert(client);
        }
        metrics::counter!("batching_dispatch_total", "outcome" => "failure").increment(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::Payload;
    use std::sync::Arc;
    use std::thread;

    struct Identity;
    impl Backend for Identity {
        fn run(&self, inputs: Vec<Payload>) -> Result<Vec<Payload>, crate::error::BackendError> {
            Ok(inputs)
        }
    }

    struct Affine {
        scale: f32,
        offset: f32,
    }
    impl Backend for Affine {
        fn run(&self, inputs: Vec<Payload>) -> Result<Vec<Payload>, crate::error::BackendError> {
            Ok(inputs
                .into_iter()
                .map(|item| match item {
                    Payload::Tensor(values) => Payload::Tensor(
                        values.into_iter().map(|v| self.scale * v + self.offset).collect(),
                    ),
                    other => other,
                })
                .collect())
        }
    }

    struct AlwaysFails;
    impl Backend for AlwaysFails {
        fn run(&self, _inputs: Vec<Payload>) -> Result<Vec<Payload>, crate::error::BackendError> {
            Err(crate::error::BackendError::ExecutionFailed("boom".into()))
        }
    }

    fn tensor_request(client_id: &str, values: Vec<f32>) -> BatchRequest {
        BatchRequest {
            client_id: client_id.to_string(),
            items: vec![Payload::Tensor(values)],
            shape: None,
        }
    }

    #[test]
    fn add_to_batch_before_bind_is_rejected() {
        let batcher = Batcher::new(1);
        let err = batcher
            .add_to_batch(tensor_request("a", vec![1.0]))
            .unwrap_err();
        assert!(matches!(err, BatcherError::NeedBindCall));
    }

    #[test]
    fn single_item_echo_roundtrip() {
        let batcher = Batcher::new(1);
        batcher.bind(BindSource::InMemory(Box::new(Identity))).unwrap();
        batcher.add_to_batch(tensor_request("a", vec![7.0])).unwrap();

        let cancel = AtomicBool::new(false);
        let outputs = batcher.get_result("a", &cancel).unwrap().unwrap();
        assert_eq!(outputs, vec![Payload::Tensor(vec![7.0])]);
    }

    #[test]
    fn fill_and_flush_affine_backend() {
        let batcher = Arc::new(Batcher::new(1));
        batcher
            .bind(BindSource::InMemory(Box::new(Affine {
                scale: 2.0,
                offset: 1.0,
            })))
            .unwrap();

        let ones = vec![1.0f32; 600];
        batcher.add_to_batch(tensor_request("a", ones)).unwrap();

        let cancel = AtomicBool::new(false);
        let outputs = batcher.get_result("a", &cancel).unwrap().unwrap();
        let Payload::Tensor(values) = &outputs[0] else {
            panic!("expected tensor payload");
        };
        assert!(values.iter().all(|&v| v == 1201.0));
    }

    #[test]
    fn two_clients_share_one_batch() {
        let batcher = Arc::new(Batcher::new(3));
        batcher
            .bind(BindSource::InMemory(Box::new(Affine {
                scale: 2.0,
                offset: 1.0,
            })))
            .unwrap();

        batcher
            .add_to_batch(BatchRequest {
                client_id: "a".into(),
                items: vec![Payload::Tensor(vec![1.0]), Payload::Tensor(vec![1.0])],
                shape: None,
            })
            .unwrap();
        batcher.add_to_batch(tensor_request("z", vec![0.0])).unwrap();

        let cancel = AtomicBool::new(false);
        let z_out = batcher.get_result("z", &cancel).unwrap().unwrap();
        assert_eq!(z_out, vec![Payload::Tensor(vec![1.0])]);

        let a_out = batcher.get_result("a", &cancel).unwrap().unwrap();
        assert_eq!(a_out.len(), 2);
        for item in a_out {
            let Payload::Tensor(values) = item else {
                panic!("expected tensor payload");
            };
            assert_eq!(values, vec![1201.0]);
        }
    }

    #[test]
    fn two_items_one_client_single_batch() {
        let batcher = Arc::new(Batcher::new(2));
        batcher
            .bind(BindSource::InMemory(Box::new(Affine {
                scale: 2.0,
                offset: 1.0,
            })))
            .unwrap();

        batcher.add_to_batch(tensor_request("a", vec![1.0])).unwrap();
        batcher.add_to_batch(tensor_request("a", vec![1.0])).unwrap();

        let cancel = AtomicBool::new(false);
        let a_out = batcher.get_result("a", &cancel).unwrap().unwrap();
        assert_eq!(a_out.len(), 2);
        for item in a_out {
            let Payload::Tensor(values) = item else {
                panic!("expected tensor payload");
            };
            assert_eq!(values, vec![1201.0]);
        }
    }

    #[test]
    fn oversize_request_is_rejected() {
        let batcher = Batcher::new(1);
        batcher.bind(BindSource::InMemory(Box::new(Identity))).unwrap();
        let err = batcher
            .add_to_batch(BatchRequest {
                client_id: "a".into(),
                items: vec![Payload::Tensor(vec![1.0]), Payload::Tensor(vec![2.0])],
                shape: None,
            })
            .unwrap_err();
        assert!(matches!(
            err,
            BatcherError::BatchTooLarge {
                requested: 2,
                capacity: 1
            }
        ));
    }

    #[test]
    fn set_batch_size_rejects_shrink_below_current_fill() {
        let batcher = Batcher::new(3);
        batcher.bind(BindSource::InMemory(Box::new(Identity))).unwrap();
        batcher.add_to_batch(tensor_request("a", vec![1.0])).unwrap();
        batcher.add_to_batch(tensor_request("b", vec![1.0])).unwrap();

        let err = batcher.set_batch_size(1).unwrap_err();
        assert!(matches!(err, BatcherError::NextBatch));
    }

    #[test]
    fn set_batch_size_grows_and_accepts_more() {
        let batcher = Arc::new(Batcher::new(2));
        batcher
            .bind(BindSource::InMemory(Box::new(Affine {
                scale: 1.0,
                offset: 0.0,
            })))
            .unwrap();
        batcher.add_to_batch(tensor_request("a", vec![1.0])).unwrap();
        batcher.set_batch_size(3).unwrap();
        batcher.add_to_batch(tensor_request("b", vec![2.0])).unwrap();
        batcher.add_to_batch(tensor_request("c", vec![3.0])).unwrap();

        let cancel = AtomicBool::new(false);
        assert_eq!(
            batcher.get_result("a", &cancel).unwrap().unwrap(),
            vec![Payload::Tensor(vec![1.0])]
        );
        assert_eq!(
            batcher.get_result("c", &cancel).unwrap().unwrap(),
            vec![Payload::Tensor(vec![3.0])]
        );
    }

    #[test]
    fn failed_backend_wakes_waiters_with_error_and_recovers() {
        let batcher = Arc::new(Batcher::new(1));
        batcher.bind(BindSource::InMemory(Box::new(AlwaysFails))).unwrap();
        batcher.add_to_batch(tensor_request("a", vec![1.0])).unwrap();

        let cancel = AtomicBool::new(false);
        let err = batcher.get_result("a", &cancel).unwrap().unwrap_err();
        assert!(matches!(err, BatcherError::Internal(_)));

        // batch state must have been cleared despite the failure
        batcher.add_to_batch(tensor_request("b", vec![2.0])).unwrap();
        let err = batcher.get_result("b", &cancel).unwrap().unwrap_err();
        assert!(matches!(err, BatcherError::Internal(_)));
    }

    #[test]
    fn concurrent_admissions_preserve_item_count_invariant() {
        let batcher = Arc::new(Batcher::new(8));
        batcher
            .bind(BindSource::InMemory(Box::new(Affine {
                scale: 1.0,
                offset: 0.0,
            })))
            .unwrap();

        let mut handles = Vec::new();
        for i in 0..8 {
            let batcher = Arc::clone(&batcher);
            handles.push(thread::spawn(move || {
                let client_id = format!("client-{i}");
                batcher
                    .add_to_batch(tensor_request(&client_id, vec![i as f32]))
                    .unwrap();
                let cancel = AtomicBool::new(false);
                batcher.get_result(&client_id, &cancel).unwrap().unwrap()
            }));
        }

        let mut seen = Vec::new();
        for handle in handles {
            let out = handle.join().unwrap();
            let Payload::Tensor(values) = &out[0] else {
                panic!("expected tensor payload");
            };
            seen.push(values[0] as i32);
        }
        seen.sort_unstable();
        assert_eq!(seen, (0..8).collect::<Vec<_>>());
    }

    #[test]
    fn rebind_after_bound_is_rejected() {
        let batcher = Batcher::new(1);
        batcher.bind(BindSource::InMemory(Box::new(Identity))).unwrap();
        let err = batcher
            .bind(BindSource::InMemory(Box::new(Identity)))
            .unwrap_err();
        assert!(matches!(err, BatcherError::AlreadyBound));
    }
}
