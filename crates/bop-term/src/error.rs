use std::fmt::{Display, Formatter};

/// Reason an offer or claim could not proceed right now.
///
/// None of these are failures: the publication state is unchanged apart from the
/// rotation work the call performed, and the caller is expected to retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BackpressureKind {
    /// The position of the active term reached the flow-control limit.
    FlowControl,
    /// The active term was exhausted; the retry lands in the next term.
    TermRotation,
    /// The next term has not been cleaned yet, so rotation was deferred.
    Cleaning,
}

impl Display for BackpressureKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            BackpressureKind::FlowControl => write!(f, "flow control"),
            BackpressureKind::TermRotation => write!(f, "term rotation"),
            BackpressureKind::Cleaning => write!(f, "cleaning"),
        }
    }
}

/// Error type for term buffer and publication operations.
#[non_exhaustive]
#[derive(Debug, thiserror::Error)]
pub enum TermError {
    /// An I/O error occurred while mapping term storage.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    /// Configuration value was invalid.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    /// Non-blocking operation could not proceed; retry later.
    #[error("would block: {0}")]
    WouldBlock(BackpressureKind),
    /// Message exceeds the largest message a term can hold.
    #[error("message length {length} exceeds max message length {max}")]
    MessageTooLarge { length: usize, max: usize },
    /// Claim length exceeds the largest payload a single frame can carry.
    #[error("claim length {length} exceeds max payload length {max}")]
    InvalidClaimLength { length: usize, max: usize },
    /// Offset and length do not describe a range inside the source buffer.
    #[error("range offset={offset} length={length} outside buffer of {capacity} bytes")]
    InvalidRange {
        offset: usize,
        length: usize,
        capacity: usize,
    },
    /// The publication has been released.
    #[error("publication closed")]
    Closed,
    /// Invalid state transition or operation.
    #[error("invalid state: {0}")]
    InvalidState(String),
}

impl TermError {
    /// Create a would-block error annotated with the given backpressure kind.
    pub fn would_block(kind: BackpressureKind) -> Self {
        Self::WouldBlock(kind)
    }

    /// Create an invalid configuration error from a displayable value.
    pub fn invalid_config<T>(msg: T) -> Self
    where
        T: Display,
    {
        Self::InvalidConfig(msg.to_string())
    }

    /// Create an invalid state error from a displayable value.
    pub fn invalid_state<T>(msg: T) -> Self
    where
        T: Display,
    {
        Self::InvalidState(msg.to_string())
    }

    /// Returns true when the operation may succeed if retried.
    pub fn is_would_block(&self) -> bool {
        matches!(self, Self::WouldBlock(_))
    }

    /// Backpressure kind for would-block errors.
    pub fn backpressure_kind(&self) -> Option<BackpressureKind> {
        match self {
            Self::WouldBlock(kind) => Some(*kind),
            _ => None,
        }
    }
}

/// A Result type alias for term buffer operations.
pub type TermResult<T> = Result<T, TermError>;
