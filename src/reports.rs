use anyhow::{Context, Result};
use cem_engine::correction::{qa_event_date_parts, sort_qa_events};
use cem_engine::qa::{AnnualQaRow, MonthlyQaRow};
use cem_engine::scaling::MonthKey;
use cem_engine::{MonthlyTotal, QaEvent, SourceId, UnitId};
use chrono::Timelike;
use log::{info, warn};
use serde::Serialize;
use std::path::Path;

#[derive(Debug, Serialize)]
struct QaEventRow<'a> {
    oris_facility_code: &'a str,
    oris_boiler_id: &'a str,
    year: i32,
    month: u32,
    day: u32,
    hour: u32,
    field: &'static str,
    measurement_code: u8,
    original_value: f64,
    replacement_value: f64,
}

/// The correction QA log, ordered by unit, date and field.
pub fn write_qa_events(path: &Path, events: &mut [QaEvent]) -> Result<()> {
    sort_qa_events(events);
    let mut writer = csv::Writer::from_path(path).with_context(|| format!("Creating {}", path.display()))?;
    for e in events.iter() {
        let (year, month, day) = qa_event_date_parts(e);
        writer.serialize(QaEventRow {
            oris_facility_code: &e.unit.facility,
            oris_boiler_id: &e.unit.boiler,
            year,
            month,
            day,
            hour: e.timestamp.hour(),
            field: e.field.label(),
            measurement_code: e.measurement_code.code(),
            original_value: cem_engine::calendar::round_to(e.original_value, 4),
            replacement_value: cem_engine::calendar::round_to(e.replacement_value, 4),
        })?;
    }
    writer.flush()?;
    info!("Wrote {} correction QA rows to {}", events.len(), path.display());
    Ok(())
}

fn write_rows<T: Serialize>(path: &Path, rows: &[T]) -> Result<()> {
    let mut writer = csv::Writer::from_path(path).with_context(|| format!("Creating {}", path.display()))?;
    for row in rows {
        writer.serialize(row)?;
    }
    writer.flush()?;
    Ok(())
}

pub fn write_annual_qa(path: &Path, rows: &[AnnualQaRow]) -> Result<()> {
    write_rows(path, rows)?;
    info!("Wrote annual QA ({} rows) to {}", rows.len(), path.display());
    Ok(())
}

pub fn write_monthly_qa(path: &Path, rows: &[MonthlyQaRow]) -> Result<()> {
    write_rows(path, rows)?;
    if !rows.is_empty() {
        warn!("{} unit months differ from CEMS, see {}", rows.len(), path.display());
    }
    Ok(())
}

/// Non-fatal findings of a run, for operator review.
#[derive(Debug, Default, Serialize)]
pub struct Advisories {
    pub unresolved_units: Vec<UnitId>,
    pub unmatched_units: Vec<UnitId>,
    pub unshifted_units: Vec<UnitId>,
    pub zero_denominator: Vec<MonthlyTotal>,
    pub unreconciled: Vec<MonthKey>,
    pub missing_hourly: Vec<MonthlyTotal>,
    pub hourly_rows_without_region: usize,
    pub sources_without_region: Vec<SourceId>,
}

impl Advisories {
    pub fn total(&self) -> usize {
        self.unresolved_units.len()
            + self.unmatched_units.len()
            + self.unshifted_units.len()
            + self.zero_denominator.len()
            + self.unreconciled.len()
            + self.missing_hourly.len()
            + self.hourly_rows_without_region
    }

    pub fn write(&self, path: &Path) -> Result<()> {
        let file = std::fs::File::create(path).with_context(|| format!("Creating {}", path.display()))?;
        serde_json::to_writer_pretty(file, self)?;
        if self.total() > 0 {
            warn!("{} advisories written to {}", self.total(), path.display());
        }
        Ok(())
    }
}
