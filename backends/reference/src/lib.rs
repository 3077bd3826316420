//! Reference `Backend` implementations used to make this repository
//! buildable and testable end-to-end without a real compute engine behind
//! it. None of these are the "opaque Backend" the core batching engine is
//! agnostic to; they exist for smoke tests, the benchmark harness, and the
//! launcher's `--backend reference:<kind>` option.

use batching_router::backend::{Backend, Payload};
use batching_router::error::BackendError;

/// Returns every input unchanged. Used for single-item smoke tests.
#[derive(Debug, Default)]
pub struct EchoBackend;

impl Backend for EchoBackend {
    fn run(&self, inputs: Vec<Payload>) -> Result<Vec<Payload>, BackendError> {
        Ok(inputs)
    }
}

/// `y = scale * x + offset`, applied element-wise to tensor payloads.
/// Opaque payloads pass through unchanged, since an affine transform has no
/// meaning for a framework-specific byte blob.
#[derive(Debug, Clone, Copy)]
pub struct AffineBackend {
    pub scale: f32,
    pub offset: f32,
}

impl AffineBackend {
    pub fn new(scale: f32, offset: f32) -> Self {
        Self { scale, offset }
    }
}

impl Backend for AffineBackend {
    fn run(&self, inputs: Vec<Payload>) -> Result<Vec<Payload>, BackendError> {
        Ok(inputs
            .into_iter()
            .map(|item| match item {
                Payload::Tensor(values) => Payload::Tensor(
                    values
                        .into_iter()
                        .map(|v| self.scale * v + self.offset)
                        .collect(),
                ),
                other @ Payload::Opaque(_) => other,
            })
            .collect())
    }
}

/// Fails every dispatch it is given. Exercises the wake-with-error recovery
/// path: every client in the failed batch must observe an error from
/// `GetResult` rather than block forever, and the Batcher must recover to
/// accept a following batch.
#[derive(Debug, Default)]
pub struct AlwaysFailsBackend;

impl Backend for AlwaysFailsBackend {
    fn run(&self, _inputs: Vec<Payload>) -> Result<Vec<Payload>, BackendError> {
        Err(BackendError::ExecutionFailed(
            "reference always-fails backend invoked".into(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn echo_returns_inputs_unchanged() {
        let backend = EchoBackend;
        let out = backend.run(vec![Payload::Tensor(vec![7.0])]).unwrap();
        assert_eq!(out, vec![Payload::Tensor(vec![7.0])]);
    }

    #[test]
    fn affine_applies_scale_and_offset() {
        let backend = AffineBackend::new(2.0, 1.0);
        let out = backend
            .run(vec![Payload::Tensor(vec![1.0, 1.0])])
            .unwrap();
        assert_eq!(out, vec![Payload::Tensor(vec![3.0, 3.0])]);
    }

    #[test]
    fn always_fails_backend_errors() {
        let backend = AlwaysFailsBackend;
        assert!(backend.run(vec![Payload::Tensor(vec![1.0])]).is_err());
    }
}
