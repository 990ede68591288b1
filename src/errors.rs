use thiserror::Error;


#[derive(Debug, PartialEq, Eq, Clone, Error)]
pub enum ConfigError {
    #[error("invalid configuration: max_concurrency must be positive, got {max_concurrency}")]
    InvalidConfiguration { max_concurrency: usize },
}


/// Why a worker loop stopped before it saw an empty queue.
///
/// Handler failures carry the sequence number of the item that failed so the
/// caller can correlate them with its own per-item reporting.
#[derive(Debug, Error)]
pub enum WorkerError<E> {
    #[error("handler failed on item #{sequence}")]
    Handler {
        sequence: usize,
        #[source]
        source: E,
    },

    #[error("handler panicked on item #{sequence}: {message}")]
    Panic {
        sequence: usize,
        message: String,
    },

    /// The processor never closes its gate, so a run does not produce this
    /// today; a closed semaphore is reported here instead of panicking.
    #[error("concurrency gate closed")]
    GateClosed,

    #[error("run driver stopped before reporting")]
    ChannelClosed,
}

impl<E> WorkerError<E> {
    /// Sequence number of the failed item, if the failure belongs to one.
    pub fn sequence(&self) -> Option<usize> {
        match self {
            WorkerError::Handler { sequence, .. } | WorkerError::Panic { sequence, .. } => Some(*sequence),
            WorkerError::GateClosed | WorkerError::ChannelClosed => None,
        }
    }

    #[inline]
    pub fn is_panic(&self) -> bool {
        matches!(self, WorkerError::Panic { .. })
    }
}


pub type RunResult<E> = Result<(), WorkerError<E>>;
