use thiserror::Error;

/// Failure taxonomy of the engine. Directory lookups never appear here: a
/// failed lookup recovers locally with a fallback display value instead of
/// surfacing. There is no fatal class; every failure is scoped to one
/// operation on one session or message.
#[derive(Debug, Error)]
pub enum CoreError {
    /// A send was not delivered. The local pending message remains and is not
    /// retried automatically.
    #[error("transport failure: {source}")]
    Transport {
        #[source]
        source: anyhow::Error,
    },
    /// A durable read/write failed. In-memory state is not rolled back, so
    /// the in-memory and durable views may diverge until the next successful
    /// write.
    #[error("persistence failure: {source}")]
    Persistence {
        #[source]
        source: anyhow::Error,
    },
}

impl CoreError {
    pub fn transport(source: anyhow::Error) -> Self {
        CoreError::Transport { source }
    }

    pub fn persistence(source: anyhow::Error) -> Self {
        CoreError::Persistence { source }
    }
}

pub type CoreResult<T> = Result<T, CoreError>;
