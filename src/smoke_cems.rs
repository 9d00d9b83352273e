use anyhow::{Context, Result};
use cem_engine::HourlyReading;
use chrono::Datelike;
use csv::WriterBuilder;
use log::info;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

const MISSING: &str = "-9";

// Whole numbers keep one decimal place
fn float_text(v: f64) -> String {
    let v = cem_engine::calendar::round_to(v, 4);
    if v.fract() == 0.0 {
        format!("{:.1}", v)
    } else {
        v.to_string()
    }
}

fn measured(value: Option<f64>) -> String {
    value.map(float_text).unwrap_or_else(|| MISSING.to_string())
}

/// One line of the legacy SMOKE hourly CEM format.
pub fn format_reading(r: &HourlyReading) -> Vec<String> {
    vec![
        r.unit.facility.clone(),
        r.unit.boiler.clone(),
        r.timestamp.format("%y%m%d").to_string().trim_start_matches('0').to_string(),
        r.hour().to_string(),
        measured(r.nox),
        measured(r.so2),
        measured(r.nox_rate),
        r.op_time.map(float_text).unwrap_or_default(),
        measured(r.gross_load),
        measured(r.steam_load),
        measured(r.heat_input),
        String::new(),
        r.quality.so2.code().to_string(),
        r.quality.nox.code().to_string(),
        r.quality.nox_rate.code().to_string(),
        MISSING.to_string(),
    ]
}

/// Write `HOUR_UNIT_{year}_{mm}.txt` for each month.
pub fn write_old_cems(
    output_path: &Path,
    year: i32,
    months: &BTreeSet<u32>,
    readings: &[HourlyReading],
) -> Result<Vec<PathBuf>> {
    let mut written = Vec::new();
    for &month in months {
        let path = output_path.join(format!("HOUR_UNIT_{}_{:02}.txt", year, month));
        let file = std::fs::File::create(&path).with_context(|| format!("Creating {}", path.display()))?;
        let mut writer = WriterBuilder::new().has_headers(false).from_writer(file);

        let mut count = 0usize;
        for r in readings
            .iter()
            .filter(|r| r.timestamp.year() == year && r.timestamp.month() == month)
        {
            writer.write_record(format_reading(r))?;
            count += 1;
        }
        writer.flush()?;
        info!("Wrote {} old format CEM records to {}", count, path.display());
        written.push(path);
    }
    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;
    use cem_engine::{Channel, QualityCode, QualityFlags, UnitId};
    use chrono::NaiveDate;
    use tempfile::TempDir;

    #[test]
    fn test_old_format_line() {
        let ts = NaiveDate::from_ymd_opt(2016, 3, 9).unwrap().and_hms_opt(7, 0, 0).unwrap();
        let mut flags = QualityFlags::all(QualityCode::Measured);
        flags.so2 = QualityCode::Substitute;
        let r = HourlyReading::new(UnitId::new("3", "1"), ts)
            .with_value(Channel::Nox, 12.34567)
            .with_value(Channel::HeatInput, 600.0)
            .with_value(Channel::OpTime, 1.0)
            .with_quality(flags);

        let line = format_reading(&r).join(",");
        assert_eq!(line, "3,1,160309,7,12.3457,-9,-9,1.0,-9,-9,600.0,,3,1,1,-9");
    }

    #[test]
    fn test_partial_and_missing_op_time() {
        let ts = NaiveDate::from_ymd_opt(2016, 11, 20).unwrap().and_hms_opt(0, 0, 0).unwrap();
        let partial = HourlyReading::new(UnitId::new("3", "1"), ts).with_value(Channel::OpTime, 0.25);
        assert_eq!(format_reading(&partial)[7], "0.25");

        let idle = HourlyReading::new(UnitId::new("3", "1"), ts);
        assert_eq!(format_reading(&idle)[7], "");
        assert_eq!(format_reading(&idle)[2], "161120");
    }

    #[test]
    fn test_months_split_into_files() {
        let dir = TempDir::new().unwrap();
        let unit = UnitId::new("3", "1");
        let jan = NaiveDate::from_ymd_opt(2016, 1, 31).unwrap().and_hms_opt(23, 0, 0).unwrap();
        let feb = NaiveDate::from_ymd_opt(2016, 2, 1).unwrap().and_hms_opt(0, 0, 0).unwrap();
        let readings = vec![HourlyReading::new(unit.clone(), jan), HourlyReading::new(unit, feb)];
        let months: BTreeSet<u32> = [1, 2].into_iter().collect();

        let files = write_old_cems(dir.path(), 2016, &months, &readings).unwrap();
        assert_eq!(files.len(), 2);
        let jan_text = std::fs::read_to_string(&files[0]).unwrap();
        assert_eq!(jan_text.lines().count(), 1);
        assert!(files[1].ends_with("HOUR_UNIT_2016_02.txt"));
    }
}
