use chrono::NaiveDateTime;
use thiserror::Error;

use crate::models::UnitId;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("duplicate hourly reading for unit {unit} at {timestamp}")]
    DuplicateReading { unit: UnitId, timestamp: NaiveDateTime },

    #[error("invalid processing year {0}")]
    InvalidYear(i32),

    #[error("invalid month {0}, expected 1-12")]
    InvalidMonth(u32),
}

pub type Result<T> = std::result::Result<T, EngineError>;
