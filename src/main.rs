use anyhow::Result;
use cem_engine::CorrectionConfig;
use clap::Parser;
use log::info;
use std::collections::BTreeSet;
use std::path::PathBuf;

mod campd_reader;
mod ff10;
mod pipeline;
mod reports;
mod smoke_cems;
mod timezone;

use pipeline::{Pipeline, RunConfig};

#[derive(Parser)]
#[command(name = "cemconvert")]
#[command(about = "Convert CAMPD hourly CEMS into hourly and annual FF10 point inventories")]
struct Args {
    /// Annual FF10 point inventory for the EGUs
    ann_ff10: PathBuf,

    /// Pollutants in the hourly CEM files to process
    #[arg(short = 'p', long, value_delimiter = ',', default_value = "NOX,SO2,CO2")]
    cempolls: Vec<String>,

    /// Year to process
    #[arg(short, long, env = "YEAR", default_value_t = 2016)]
    year: i32,

    /// Hourly CEM input path
    #[arg(short, long, env = "CEMPATH", default_value = "input")]
    input_path: PathBuf,

    /// FF10 inventory output path
    #[arg(short, long, env = "OUTPATH", default_value = "output")]
    output_path: PathBuf,

    /// Write hourly CEM data in the old SMOKE format
    #[arg(short = 'c', long)]
    write_cems: bool,

    /// Output hourly FF10 in GMT instead of local standard time
    #[arg(short, long)]
    gmt: bool,

    /// Fold hours shifted into the following year back onto the run year
    #[arg(short, long)]
    ramp_up: bool,

    /// Pollutant name used for the temporal activity
    #[arg(short, long, default_value = "HOURACT")]
    temporal_var: String,

    /// Inventory pollutants to temporalize with the CEM activity
    #[arg(short = 'n', long, value_delimiter = ',', default_value = "PM25-PRI")]
    inven_polls: Vec<String>,

    /// CEM months to process. Defaults to every month with a file
    #[arg(short, long, env = "MONTHS", value_delimiter = ',')]
    months: Option<Vec<u32>>,

    /// Output inventory label
    #[arg(short, long, default_value = "ptegu")]
    label: String,

    /// Keep the FF10 values for CEM pollutants and temporalize them instead of replacing with CEMs
    #[arg(short, long)]
    keep_annual: bool,

    /// Correct anomalous substituted CEM values
    #[arg(short = 'e', long)]
    cemcorrect: bool,

    /// County FIPS timezone table (region_cd,tzname,lst_offset), needed for --gmt
    #[arg(long)]
    tz_table: Option<PathBuf>,

    /// Ratio to the fallback mean above which a flagged value is replaced
    #[arg(long, default_value_t = 3.0)]
    peak_factor: f64,

    /// Fraction of a month's days with trusted data needed for a monthly mean
    #[arg(long, default_value_t = 0.3)]
    threshold: f64,
}

fn upper_list(values: Vec<String>) -> Vec<String> {
    values
        .into_iter()
        .map(|v| v.trim().to_uppercase())
        .filter(|v| !v.is_empty())
        .collect()
}

impl Args {
    fn into_config(self) -> RunConfig {
        RunConfig {
            ann_ff10: self.ann_ff10,
            year: self.year,
            input_path: self.input_path,
            output_path: self.output_path,
            months: self
                .months
                .map(|m| m.into_iter().collect::<BTreeSet<u32>>())
                .filter(|m| !m.is_empty()),
            cem_polls: upper_list(self.cempolls),
            inven_polls: upper_list(self.inven_polls),
            temporal_var: self.temporal_var,
            label: self.label,
            gmt: self.gmt,
            ramp_up: self.ramp_up,
            keep_annual: self.keep_annual,
            cemcorrect: self.cemcorrect,
            write_cems: self.write_cems,
            tz_table: self.tz_table,
            correction: CorrectionConfig {
                peak_factor: self.peak_factor,
                threshold: self.threshold,
                ..CorrectionConfig::default()
            },
        }
    }
}

fn main() -> Result<()> {
    env_logger::init();

    rayon::ThreadPoolBuilder::new()
        .num_threads(num_cpus::get())
        .build_global()?;

    let config = Args::parse().into_config();
    info!("Starting cemconvert for {} using {} threads", config.year, rayon::current_num_threads());

    let summary = Pipeline::new(config).run()?;

    info!(
        "Done: {} readings, {} corrected values, {} hourly rows, {} annual rows, {} advisories",
        summary.readings,
        summary.corrected,
        summary.hourly_rows,
        summary.annual_rows,
        summary.advisories.total()
    );
    Ok(())
}
