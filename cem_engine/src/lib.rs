pub mod calendar;
pub mod correction;
pub mod error;
pub mod inventory;
pub mod models;
pub mod qa;
pub mod scaling;
pub mod temporal;
pub mod timeshift;

pub use calendar::{gapfill_dates, pivot_hourly};
pub use correction::{correct_readings, CorrectionContext, CorrectionOutcome, MeanTable};
pub use error::{EngineError, Result};
pub use models::{
    AnnualEmissionRecord, Channel, CorrectionConfig, DailyProfile, HourlyReading, InventoryRecord, MeanSelection,
    MonthlyTotal, QaEvent, QualityCode, QualityFlags, SeriesKey, SourceId, SourceKey, TemporalFactor, UnitId,
};
pub use scaling::{scale_hourly, ScalingOutcome};
pub use temporal::TemporalAllocator;
