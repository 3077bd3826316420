use crate::error::{BackendError, BatcherError};

/// A single batch item's payload, after the wire's flat buffer has been
/// sliced into per-item chunks. Exactly one of the two wire fields is
/// populated by convention between a client and its backend; everything
/// downstream of the wire treats this as an opaque chunk of that kind.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Tensor(Vec<f32>),
    Opaque(Vec<u8>),
}

/// The opaque compute capability the batching core dispatches to. A
/// backend receives exactly the items admitted into one batch, in slice
/// order, and must return exactly as many outputs, in the same order.
///
/// Implementations do not interact with client identity, locking, or the
/// wire protocol at all; the core handles all of that around a call to
/// `run`.
pub trait Backend: Send + Sync {
    fn run(&self, inputs: Vec<Payload>) -> Result<Vec<Payload>, BackendError>;

    /// Optional input shape this backend expects, used to validate
    /// requests that carry shape metadata. `None` means no validation.
    fn declared_shape(&self) -> Option<(u32, u32, u32)> {
        None
    }
}

/// How a backend is supplied to `Batcher::bind`. Replaces a
/// downcast-from-base-class binding descriptor with a tagged variant: the
/// core matches on the variant instead of attempting to interpret an
/// opaque pointer.
pub enum BindSource {
    /// A backend instance that is already constructed and ready to run.
    InMemory(Box<dyn Backend>),
    /// A loader that constructs a backend lazily, e.g. by reading model
    /// files from disk. Invoked once, at bind time.
    FromFiles(Box<dyn FnOnce() -> Result<Box<dyn Backend>, BackendError> + Send>),
}

impl BindSource {
    pub(crate) fn resolve(self) -> Result<Box<dyn Backend>, BatcherError> {
        match self {
            BindSource::InMemory(backend) => Ok(backend),
            BindSource::FromFiles(loader) => {
                loader().map_err(|_| BatcherError::NoSuitableBindArgs)
            }
        }
    }
}
