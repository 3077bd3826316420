use thiserror::Error;

/// Outcome of a `Batcher` operation, mirroring the return-code contract of
/// the original batching service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReturnCode {
    Ok,
    NeedBindCall,
    ShapeIncorrect,
    NextBatch,
    BatchTooLarge,
    NoSuitableBindArgs,
    AlreadyBound,
    Internal,
}

#[derive(Error, Debug)]
pub enum BatcherError {
    #[error("batch must be bound with a backend before it can accept requests")]
    NeedBindCall,
    #[error("request shape does not match the bound backend's declared input shape")]
    ShapeIncorrect,
    #[error("batch is full, retry the request against the next batch")]
    NextBatch,
    #[error("request of {requested} items exceeds batch capacity {capacity}")]
    BatchTooLarge { requested: usize, capacity: usize },
    #[error("binding descriptor could not be resolved to a usable backend")]
    NoSuitableBindArgs,
    #[error("batch has already been bound to a backend")]
    AlreadyBound,
    #[error("backend failed while executing batch: {0}")]
    Internal(String),
}

impl BatcherError {
    pub fn code(&self) -> ReturnCode {
        match self {
            BatcherError::NeedBindCall => ReturnCode::NeedBindCall,
            BatcherError::ShapeIncorrect => ReturnCode::ShapeIncorrect,
            BatcherError::NextBatch => ReturnCode::NextBatch,
            BatcherError::BatchTooLarge { .. } => ReturnCode::BatchTooLarge,
            BatcherError::NoSuitableBindArgs => ReturnCode::NoSuitableBindArgs,
            BatcherError::AlreadyBound => ReturnCode::AlreadyBound,
            BatcherError::Internal(_) => ReturnCode::Internal,
        }
    }

    /// Short tag for this error's `ReturnCode`, used for log fields and
    /// metric label values.
    pub fn error_type(&self) -> &'static str {
        match self.code() {
            ReturnCode::NeedBindCall => "need_bind_call",
            ReturnCode::ShapeIncorrect => "shape_incorrect",
            ReturnCode::NextBatch => "next_batch",
            ReturnCode::BatchTooLarge => "batch_too_large",
            ReturnCode::NoSuitableBindArgs => "no_suitable_bind_args",
            ReturnCode::AlreadyBound => "already_bound",
            ReturnCode::Internal => "internal",
            ReturnCode::Ok => "ok",
        }
    }
}

#[derive(Error, Debug)]
pub enum BackendError {
    #[error("backend failed to produce outputs: {0}")]
    ExecutionFailed(String),
    #[error("backend returned {got} outputs for {expected} inputs")]
    OutputLengthMismatch { expected: usize, got: usize },
}

#[derive(Error, Debug)]
pub enum RouterError {
    #[error("unknown client id")]
    UnknownClient,
    #[error(transparent)]
    Batcher(#[from] BatcherError),
    #[error("malformed request: {0}")]
    Malformed(String),
}

impl RouterError {
    pub fn error_type(&self) -> &'static str {
        match self {
            RouterError::UnknownClient => "unknown_client",
            RouterError::Batcher(err) => err.error_type(),
            RouterError::Malformed(_) => "malformed",
        }
    }
}
