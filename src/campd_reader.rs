use anyhow::{bail, Context, Result};
use cem_engine::calendar::ensure_unique;
use cem_engine::{Channel, HourlyReading, QualityCode, QualityFlags, UnitId};
use chrono::{Duration, NaiveDate};
use glob::glob;
use indicatif::{ProgressBar, ProgressStyle};
use log::{debug, info, warn};
use polars::prelude::*;
use rayon::prelude::*;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

pub const MONTH_NAMES: [&str; 12] = [
    "jan", "feb", "mar", "apr", "may", "jun", "jul", "aug", "sep", "oct", "nov", "dec",
];

const FACILITY_ID: &str = "Facility ID";
const UNIT_ID: &str = "Unit ID";
const DATE: &str = "Date";
const HOUR: &str = "Hour";
const OPERATING_TIME: &str = "Operating Time";
const NOX_RATE: &str = "NOx Rate (lbs/mmBtu)";

// CAMD value columns and the channel each one feeds
const VALUE_COLUMNS: [(&str, Channel); 6] = [
    ("Gross Load (MW)", Channel::GrossLoad),
    ("Steam Load (1000 lb/hr)", Channel::SteamLoad),
    ("Heat Input (mmBtu)", Channel::HeatInput),
    ("SO2 Mass (lbs)", Channel::So2),
    ("CO2 Mass (short tons)", Channel::Co2),
    ("NOx Mass (lbs)", Channel::Nox),
];

const HEAT_INPUT_MEASURE: &str = "Heat Input Measure Indicator";
const NOX_MEASURE: &str = "NOx Mass Measure Indicator";
const SO2_MEASURE: &str = "SO2 Mass Measure Indicator";
const CO2_MEASURE: &str = "CO2 Mass Measure Indicator";
const NOX_RATE_MEASURE: &str = "NOx Rate Measure Indicator";

const MEASURE_COLUMNS: [&str; 5] = [HEAT_INPUT_MEASURE, NOX_MEASURE, SO2_MEASURE, CO2_MEASURE, NOX_RATE_MEASURE];

/// Reads the CAMPD monthly hourly files `campd-{year}-{mon}-hourly.txt`.
pub struct CampdReader {
    input_path: PathBuf,
    year: i32,
}

impl CampdReader {
    pub fn new(input_path: impl Into<PathBuf>, year: i32) -> Self {
        Self {
            input_path: input_path.into(),
            year,
        }
    }

    pub fn month_file(&self, month: u32) -> Result<PathBuf> {
        let name = MONTH_NAMES
            .get(month.wrapping_sub(1) as usize)
            .with_context(|| format!("Invalid month {}", month))?;
        Ok(self
            .input_path
            .join(format!("campd-{}-{}-hourly.txt", self.year, name)))
    }

    /// Months with a file present for the year.
    pub fn discover_months(&self) -> Result<BTreeSet<u32>> {
        let pattern = self.input_path.join(format!("campd-{}-*-hourly.txt", self.year));
        let pattern = pattern
            .to_str()
            .with_context(|| format!("Non UTF-8 input path {}", self.input_path.display()))?;
        let re = regex::Regex::new(r"campd-\d{4}-([a-z]{3})-hourly\.txt$")?;

        let mut months = BTreeSet::new();
        for path in glob(pattern)?.filter_map(|p| p.ok()) {
            let Some(filename) = path.file_name().and_then(|f| f.to_str()) else {
                continue;
            };
            if let Some(caps) = re.captures(filename) {
                if let Some(idx) = MONTH_NAMES.iter().position(|m| *m == &caps[1]) {
                    months.insert(idx as u32 + 1);
                }
            }
        }
        debug!("Discovered CAMPD months {:?} under {}", months, self.input_path.display());
        Ok(months)
    }

    /// Read every requested month in parallel. Duplicate (unit, hour) keys are fatal.
    pub fn read_period(&self, months: &BTreeSet<u32>) -> Result<Vec<HourlyReading>> {
        let files: Vec<(u32, PathBuf)> = months
            .iter()
            .map(|&m| self.month_file(m).map(|f| (m, f)))
            .collect::<Result<_>>()?;

        let pb = ProgressBar::new(files.len() as u64);
        pb.set_style(
            ProgressStyle::default_bar().template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} {msg}")?,
        );

        let monthly: Vec<Result<Vec<HourlyReading>>> = files
            .par_iter()
            .map(|(month, file)| {
                let readings = read_month_file(file);
                pb.inc(1);
                pb.set_message(MONTH_NAMES[*month as usize - 1]);
                readings
            })
            .collect();
        pb.finish_and_clear();

        let mut readings = Vec::new();
        for month in monthly {
            readings.extend(month?);
        }
        ensure_unique(&readings).context("Duplicate ORIS/Date/Hour combinations found in CEMS")?;

        let nox_lbs: f64 = readings.iter().filter_map(|r| r.nox).sum();
        info!("Records read: {}  NOX sum (lb): {:.6}", readings.len(), nox_lbs);
        Ok(readings)
    }
}

fn read_frame(file: &Path) -> Result<DataFrame> {
    let mut schema_overrides = Schema::new();
    for col in [FACILITY_ID, UNIT_ID, DATE].iter().chain(MEASURE_COLUMNS.iter()) {
        schema_overrides.with_column(col.to_string().into(), DataType::Utf8);
    }
    for (col, _) in VALUE_COLUMNS.iter() {
        schema_overrides.with_column(col.to_string().into(), DataType::Float64);
    }
    for col in [OPERATING_TIME, NOX_RATE] {
        schema_overrides.with_column(col.to_string().into(), DataType::Float64);
    }

    let columns: Vec<String> = [FACILITY_ID, UNIT_ID, DATE, HOUR, OPERATING_TIME, NOX_RATE]
        .iter()
        .chain(MEASURE_COLUMNS.iter())
        .map(|c| c.to_string())
        .chain(VALUE_COLUMNS.iter().map(|(c, _)| c.to_string()))
        .collect();

    let df = CsvReader::new(std::fs::File::open(file).with_context(|| format!("Opening {}", file.display()))?)
        .has_header(true)
        .with_columns(Some(columns))
        .with_dtypes(Some(Arc::new(schema_overrides)))
        .finish()
        .with_context(|| format!("Reading {}", file.display()))?;
    Ok(df)
}

fn text_column(df: &DataFrame, name: &str) -> Result<Vec<Option<String>>> {
    let series = df.column(name)?.cast(&DataType::Utf8)?;
    let values = series.utf8()?.into_iter().map(|v| v.map(|s| s.trim().to_string())).collect();
    Ok(values)
}

fn float_column(df: &DataFrame, name: &str) -> Result<Vec<Option<f64>>> {
    let series = df.column(name)?.cast(&DataType::Float64)?;
    let values = series.f64()?.into_iter().collect();
    Ok(values)
}

pub fn read_month_file(file: &Path) -> Result<Vec<HourlyReading>> {
    let df = read_frame(file)?;
    let readings = frame_to_readings(&df).with_context(|| format!("Converting {}", file.display()))?;
    debug!("{}: {} hourly records", file.display(), readings.len());
    Ok(readings)
}

/// Convert a CAMD-named frame into readings. Measure indicator labels become quality codes.
pub fn frame_to_readings(df: &DataFrame) -> Result<Vec<HourlyReading>> {
    let facility = text_column(df, FACILITY_ID)?;
    let boiler = text_column(df, UNIT_ID)?;
    let dates = text_column(df, DATE)?;
    let hours = float_column(df, HOUR)?;
    let op_time = float_column(df, OPERATING_TIME)?;
    let nox_rate = float_column(df, NOX_RATE)?;

    let mut values = Vec::with_capacity(VALUE_COLUMNS.len());
    for (col, channel) in VALUE_COLUMNS.iter() {
        values.push((*channel, float_column(df, col)?));
    }
    let heat_meas = text_column(df, HEAT_INPUT_MEASURE)?;
    let nox_meas = text_column(df, NOX_MEASURE)?;
    let so2_meas = text_column(df, SO2_MEASURE)?;
    let co2_meas = text_column(df, CO2_MEASURE)?;
    let rate_meas = text_column(df, NOX_RATE_MEASURE)?;

    let code = |v: &Option<String>| v.as_deref().map_or(QualityCode::Unknown, QualityCode::from_label);

    let mut readings = Vec::with_capacity(df.height());
    let mut skipped = 0usize;
    for i in 0..df.height() {
        let (Some(fac), Some(unit), Some(date), Some(hour)) = (&facility[i], &boiler[i], &dates[i], hours[i]) else {
            skipped += 1;
            continue;
        };
        if !(0.0..24.0).contains(&hour) {
            bail!("Hour {} out of range for {} {} on {}", hour, fac, unit, date);
        }
        let day = NaiveDate::parse_from_str(date, "%Y-%m-%d").with_context(|| format!("Bad date '{}'", date))?;
        let timestamp = day.and_hms_opt(0, 0, 0).context("Midnight out of range")? + Duration::hours(hour as i64);

        let mut reading = HourlyReading::new(UnitId::new(fac.as_str(), unit.as_str()), timestamp);
        for (channel, column) in values.iter() {
            reading.set_value(*channel, column[i]);
        }
        reading.set_value(Channel::OpTime, op_time[i]);
        reading.nox_rate = nox_rate[i];
        reading.quality = QualityFlags {
            heat_input: code(&heat_meas[i]),
            nox: code(&nox_meas[i]),
            so2: code(&so2_meas[i]),
            co2: code(&co2_meas[i]),
            nox_rate: code(&rate_meas[i]),
        };
        readings.push(reading);
    }

    if skipped > 0 {
        warn!("Skipped {} CEMS records missing a facility, unit, date or hour", skipped);
    }
    Ok(readings)
}
