use uuid::Uuid;

/// Errors surfaced by the matcher, settlement and worker loop.
///
/// The worker's rollback/ack/nack decision (see the queue module) matches on
/// this enum directly rather than downcasting an opaque error.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("market {base}/{quote} is not registered")]
    MarketNotFound { base: String, quote: String },

    #[error("balance would go negative for user {user_id} currency {currency}")]
    NotEnoughBalance { user_id: Uuid, currency: String },

    #[error("order {0} produced a zero-volume trade against a resting order")]
    ZeroTradeVolume(Uuid),

    #[error("resting order {0} referenced by the matcher was not found in the book")]
    MissingMaker(Uuid),

    #[error("row was concurrently modified or violated a uniqueness constraint: {0}")]
    Conflict(String),

    #[error("queue or bus transport error: {0}")]
    Transport(String),

    #[error(transparent)]
    Database(#[from] sqlx::Error),
}

impl Error {
    /// Whether the queue message that triggered this error should be acked
    /// (the command itself is invalid or this is an internal bug, so
    /// redelivery would never succeed) or left unacked for redelivery
    /// (the failure was transient/concurrent).
    pub fn should_ack(&self) -> bool {
        match self {
            Error::NotEnoughBalance { .. } => true,
            Error::ZeroTradeVolume(_) => true,
            Error::MissingMaker(_) => true,
            Error::MarketNotFound { .. } => true,
            Error::Conflict(_) => false,
            Error::Transport(_) => false,
            Error::Database(_) => false,
        }
    }
}
