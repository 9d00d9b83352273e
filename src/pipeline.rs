use anyhow::{bail, Context, Result};
use cem_engine::calendar::{gapfill_dates, pivot_hourly};
use cem_engine::inventory::{
    annual_emissions, monthly_totals, replacement_totals, sources_by_unit, summarize_annual, update_inventory,
};
use cem_engine::qa::{annual_qa, monthly_qa};
use cem_engine::timeshift::{fill_ramp_up, shift_to_gmt};
use cem_engine::{
    correct_readings, scale_hourly, Channel, CorrectionConfig, DailyProfile, SeriesKey, SourceKey, TemporalAllocator,
};
use log::{debug, info};
use std::collections::BTreeSet;
use std::path::PathBuf;

use crate::campd_reader::CampdReader;
use crate::ff10::{write_hourly, AnnualInventory};
use crate::reports::{write_annual_qa, write_monthly_qa, write_qa_events, Advisories};
use crate::smoke_cems::write_old_cems;
use crate::timezone::TimezoneTable;

// Pollutants compared in the monthly hourly QA
const HOURLY_QA_POLLS: [&str; 2] = ["NOX", "SO2"];

#[derive(Debug, Clone)]
pub struct RunConfig {
    pub ann_ff10: PathBuf,
    pub year: i32,
    pub input_path: PathBuf,
    pub output_path: PathBuf,
    pub months: Option<BTreeSet<u32>>, // None runs every month with a file
    pub cem_polls: Vec<String>,
    pub inven_polls: Vec<String>,
    pub temporal_var: String,
    pub label: String,
    pub gmt: bool,
    pub ramp_up: bool,
    pub keep_annual: bool,
    pub cemcorrect: bool,
    pub write_cems: bool,
    pub tz_table: Option<PathBuf>,
    pub correction: CorrectionConfig,
}

impl RunConfig {
    pub fn validate(&self) -> Result<()> {
        if self.cem_polls.is_empty() {
            bail!("No CEM variables specified. Nothing to do.");
        }
        for poll in &self.cem_polls {
            if Channel::from_label(poll).is_none() {
                bail!("Unknown CEM variable {}", poll);
            }
        }
        if let Some(months) = &self.months {
            if let Some(bad) = months.iter().find(|m| !(1..=12).contains(*m)) {
                bail!("Invalid month {} in month list", bad);
            }
        }
        if self.gmt && self.tz_table.is_none() {
            bail!("GMT output needs a timezone table (--tz-table)");
        }
        if self.ramp_up && !self.gmt {
            bail!("--ramp-up only applies to GMT output");
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct RunSummary {
    pub readings: usize,
    pub corrected: usize,
    pub hourly_rows: usize,
    pub annual_rows: usize,
    pub advisories: Advisories,
}

pub struct Pipeline {
    config: RunConfig,
}

impl Pipeline {
    pub fn new(config: RunConfig) -> Self {
        Self { config }
    }

    fn output_file(&self, name: String) -> PathBuf {
        self.config.output_path.join(name)
    }

    pub fn run(&self) -> Result<RunSummary> {
        let cfg = &self.config;
        cfg.validate()?;
        std::fs::create_dir_all(&cfg.output_path)
            .with_context(|| format!("Creating output path {}", cfg.output_path.display()))?;

        let inventory = AnnualInventory::read(&cfg.ann_ff10)?;
        let records = inventory.records()?;

        let reader = CampdReader::new(&cfg.input_path, cfg.year);
        let months = match &cfg.months {
            Some(months) => months.clone(),
            None => reader.discover_months()?,
        };
        if months.is_empty() {
            bail!("No CAMPD hourly files for {} under {}", cfg.year, cfg.input_path.display());
        }
        info!("Processing {} months of {}", months.len(), cfg.year);

        let mut summary = RunSummary::default();
        let mut readings = reader.read_period(&months)?;
        summary.readings = readings.len();

        if cfg.cemcorrect {
            let outcome = correct_readings(readings, &cfg.correction);
            readings = outcome.readings;
            let mut qa = outcome.qa;
            summary.corrected = qa.len();
            write_qa_events(
                &self.output_file(format!("cemcorrect_qa_{}_{}.csv", cfg.label, cfg.year)),
                &mut qa,
            )?;
        }

        if cfg.write_cems {
            write_old_cems(&cfg.output_path, cfg.year, &months, &readings)?;
        }

        if let Some(tz_path) = cfg.tz_table.as_ref().filter(|_| cfg.gmt) {
            let table = TimezoneTable::read(tz_path)?;
            let offsets = table.unit_offsets(&inventory.unit_regions());
            let (shifted, unshifted) = shift_to_gmt(readings, &offsets);
            readings = shifted;
            summary.advisories.unshifted_units = unshifted;
        }

        let mut profiles = pivot_hourly(&readings);
        drop(readings);
        if cfg.gmt && cfg.ramp_up {
            profiles = fill_ramp_up(profiles, cfg.year)?;
        }
        let before = profiles.len();
        profiles.retain(|p| months.contains(&p.month()));
        debug!("{} day rows outside the run months dropped", before - profiles.len());
        let profiles = gapfill_dates(profiles, cfg.year)?;

        let output = self.allocate(&records, &profiles, &months, &mut summary.advisories)?;

        let meta = inventory.source_meta();
        let country = inventory.country();
        let mut regionless = BTreeSet::new();
        for &month in &months {
            let month_rows: Vec<DailyProfile<SourceKey>> =
                output.iter().filter(|p| p.month() == month).cloned().collect();
            let path = self.output_file(format!("pthour_{:02}_{}_{}_hourly.csv", month, cfg.year, cfg.label));
            for (source, rows) in write_hourly(&path, &country, cfg.year, &month_rows, &meta)? {
                summary.advisories.hourly_rows_without_region += rows;
                regionless.insert(source);
            }
            summary.hourly_rows += month_rows.len();

            let cem_month: Vec<DailyProfile<SeriesKey>> =
                profiles.iter().filter(|p| p.month() == month).cloned().collect();
            let qa_polls: Vec<String> = HOURLY_QA_POLLS.iter().map(|p| p.to_string()).collect();
            let rows = monthly_qa(&cem_month, &month_rows, &qa_polls);
            write_monthly_qa(
                &self.output_file(format!("qa_pthour_{:02}_{}_{}.csv", month, cfg.year, cfg.label)),
                &rows,
            )?;
        }

        summary.advisories.sources_without_region = regionless.into_iter().collect();

        let updated = update_inventory(&records, &summarize_annual(&output));
        summary.annual_rows = updated.len();
        inventory.write_annual(
            &self.output_file(format!("ptinv_{}_{}.csv", cfg.year, cfg.label)),
            cfg.year,
            &updated,
        )?;
        write_annual_qa(
            &self.output_file(format!("qa_ptinv_{}_{}.csv", cfg.year, cfg.label)),
            &annual_qa(&records, &updated, &cfg.temporal_var),
        )?;

        summary
            .advisories
            .write(&self.output_file(format!("advisories_{}_{}.json", cfg.label, cfg.year)))?;
        Ok(summary)
    }

    /// Source level day rows for the CEM pollutants, the temporalized
    /// inventory pollutants and the activity itself.
    fn allocate(
        &self,
        records: &[cem_engine::InventoryRecord],
        profiles: &[DailyProfile<SeriesKey>],
        months: &BTreeSet<u32>,
        advisories: &mut Advisories,
    ) -> Result<Vec<DailyProfile<SourceKey>>> {
        let cfg = &self.config;

        let cem_profiles: Vec<DailyProfile<SeriesKey>> = profiles
            .iter()
            .filter(|p| cfg.cem_polls.iter().any(|c| c == &p.key.poll))
            .cloned()
            .collect();
        let cem_emissions = annual_emissions(records, Some(cfg.cem_polls.as_slice()));
        let totals = if cfg.keep_annual {
            monthly_totals(records, cfg.year, months, Some(cfg.cem_polls.as_slice()))?
        } else {
            replacement_totals(&cem_profiles, &cem_emissions)
        };
        let scaled = scale_hourly(&cem_profiles, &totals);

        let allocator = TemporalAllocator::new(cfg.temporal_var.as_str());
        let temporal = allocator.calc_factors(profiles);
        let inven_emissions = annual_emissions(records, Some(cfg.inven_polls.as_slice()));
        let allocation = allocator.apply(&inven_emissions, &temporal.factors);
        let activity = allocator.activity_profiles(&temporal.factors, &sources_by_unit(&annual_emissions(records, None)));

        advisories.unresolved_units = temporal.unresolved;
        advisories.unmatched_units = allocation.unmatched;
        advisories.zero_denominator = scaled.zero_denominator;
        advisories.unreconciled = scaled.unreconciled;
        advisories.missing_hourly = scaled.missing_hourly;

        let mut output = scaled.profiles;
        output.extend(allocation.profiles);
        output.extend(activity);
        info!("{} source day rows ready for output", output.len());
        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ff10::ANNUAL_COLUMNS;
    use std::io::Write;
    use std::path::Path;
    use tempfile::TempDir;

    const CAMPD_HEADER: &str = "Facility ID,Unit ID,Date,Hour,Operating Time,Gross Load (MW),Steam Load (1000 lb/hr),\
SO2 Mass (lbs),SO2 Mass Measure Indicator,CO2 Mass (short tons),CO2 Mass Measure Indicator,NOx Mass (lbs),\
NOx Mass Measure Indicator,NOx Rate (lbs/mmBtu),NOx Rate Measure Indicator,Heat Input (mmBtu),\
Heat Input Measure Indicator";

    fn write_inputs(dir: &Path) -> PathBuf {
        let input = dir.join("input");
        std::fs::create_dir_all(&input).unwrap();
        let mut f = std::fs::File::create(input.join("campd-2016-jan-hourly.txt")).unwrap();
        writeln!(f, "{}", CAMPD_HEADER).unwrap();
        writeln!(f, "3,1,2016-01-05,10,1,100,,0,Measured,5,Measured,2000,Measured,0.2,Measured,100,Measured").unwrap();
        writeln!(f, "3,1,2016-01-05,11,1,100,,0,Measured,5,Measured,2000,Measured,0.2,Measured,100,Measured").unwrap();

        let ff10 = dir.join("annual.csv");
        let mut f = std::fs::File::create(&ff10).unwrap();
        writeln!(f, "#FORMAT=FF10_POINT\n#COUNTRY=US\n#YEAR=2016").unwrap();
        writeln!(f, "{}", ANNUAL_COLUMNS.join(",")).unwrap();
        for (poll, ann) in [("NOX", "30"), ("PM25-PRI", "3.1")] {
            let row: Vec<&str> = ANNUAL_COLUMNS
                .iter()
                .map(|c| match *c {
                    "country_cd" => "US",
                    "region_cd" => "01001",
                    "facility_id" => "F1",
                    "unit_id" => "U1",
                    "rel_point_id" => "R1",
                    "process_id" => "P1",
                    "poll" => poll,
                    "ann_value" => ann,
                    "oris_facility_code" => "3",
                    "oris_boiler_id" => "1",
                    _ => "",
                })
                .collect();
            writeln!(f, "{}", row.join(",")).unwrap();
        }
        ff10
    }

    fn config(dir: &Path, ff10: PathBuf) -> RunConfig {
        RunConfig {
            ann_ff10: ff10,
            year: 2016,
            input_path: dir.join("input"),
            output_path: dir.join("output"),
            months: None,
            cem_polls: vec!["NOX".to_string(), "SO2".to_string(), "CO2".to_string()],
            inven_polls: vec!["PM25-PRI".to_string()],
            temporal_var: "HOURACT".to_string(),
            label: "ptegu".to_string(),
            gmt: false,
            ramp_up: false,
            keep_annual: false,
            cemcorrect: true,
            write_cems: true,
            tz_table: None,
            correction: CorrectionConfig::default(),
        }
    }

    #[test]
    fn test_run_replaces_and_temporalizes() {
        let dir = TempDir::new().unwrap();
        let ff10 = write_inputs(dir.path());
        let cfg = config(dir.path(), ff10);
        let out = cfg.output_path.clone();

        let summary = Pipeline::new(cfg).run().unwrap();
        assert_eq!(summary.readings, 2);
        assert_eq!(summary.corrected, 0);
        // NOX, PM25-PRI and HOURACT for every day of January
        assert_eq!(summary.hourly_rows, 3 * 31);
        assert_eq!(summary.annual_rows, 3);

        let written = AnnualInventory::read(&out.join("ptinv_2016_ptegu.csv")).unwrap();
        let records = written.records().unwrap();
        let value = |poll: &str| records.iter().find(|r| r.poll == poll).and_then(|r| r.ann_value).unwrap();
        assert!((value("NOX") - 2.0).abs() < 1e-9);
        assert!((value("PM25-PRI") - 3.1).abs() < 1e-9);
        assert!((value("HOURACT") - 200.0).abs() < 1e-9);

        for name in [
            "pthour_01_2016_ptegu_hourly.csv",
            "qa_pthour_01_2016_ptegu.csv",
            "qa_ptinv_2016_ptegu.csv",
            "cemcorrect_qa_ptegu_2016.csv",
            "HOUR_UNIT_2016_01.txt",
            "advisories_ptegu_2016.json",
        ] {
            assert!(out.join(name).exists(), "missing {}", name);
        }
        assert_eq!(summary.advisories.unmatched_units.len(), 0);
        assert!(summary.advisories.sources_without_region.is_empty());
    }

    #[test]
    fn test_gmt_needs_timezone_table() {
        let dir = TempDir::new().unwrap();
        let ff10 = write_inputs(dir.path());
        let mut cfg = config(dir.path(), ff10);
        cfg.gmt = true;
        assert!(Pipeline::new(cfg).run().is_err());
    }

    #[test]
    fn test_unknown_cem_poll_is_rejected() {
        let dir = TempDir::new().unwrap();
        let mut cfg = config(dir.path(), dir.path().join("annual.csv"));
        cfg.cem_polls = vec!["HG".to_string()];
        assert!(cfg.validate().is_err());
    }
}
