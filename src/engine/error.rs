use ulid::Ulid;

use crate::model::Coord;

#[derive(Debug)]
pub enum EngineError {
    /// Malformed, missing or non-numeric input. Fix the request.
    InvalidInput(String),
    /// Coordinates fall outside `[0, GRID_SIZE)`. Fix the request.
    OutOfBounds {
        min_x: Coord,
        min_y: Coord,
        max_x: Coord,
        max_y: Coord,
    },
    /// The region is already (or was concurrently) claimed. Pick another region.
    OverlapConflict(Vec<Ulid>),
    /// The log could not be written. Retry later.
    StoreUnavailable(String),
    NotFound(String),
    LimitExceeded(&'static str),
}

impl EngineError {
    /// True when the caller should retry the same request later.
    pub fn is_retryable(&self) -> bool {
        matches!(self, EngineError::StoreUnavailable(_))
    }
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::InvalidInput(msg) => write!(f, "invalid input: {msg}"),
            EngineError::OutOfBounds {
                min_x,
                min_y,
                max_x,
                max_y,
            } => write!(
                f,
                "region ({min_x}, {min_y})..=({max_x}, {max_y}) is outside the grid"
            ),
            EngineError::OverlapConflict(ids) => {
                write!(f, "region overlaps {} existing spot(s):", ids.len())?;
                for id in ids {
                    write!(f, " {id}")?;
                }
                Ok(())
            }
            EngineError::StoreUnavailable(e) => write!(f, "store unavailable: {e}"),
            EngineError::NotFound(what) => write!(f, "not found: {what}"),
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
        }
    }
}

impl std::error::Error for EngineError {}
