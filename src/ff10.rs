use anyhow::{bail, Context, Result};
use cem_engine::calendar::round_to;
use cem_engine::models::HOURS;
use cem_engine::{DailyProfile, InventoryRecord, SourceId, SourceKey, UnitId};
use csv::{QuoteStyle, ReaderBuilder, WriterBuilder};
use log::{info, warn};
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::io::Write;
use std::path::Path;

/// FF10_POINT annual columns in file order.
pub const ANNUAL_COLUMNS: [&str; 77] = [
    "country_cd", "region_cd", "tribal_code", "facility_id", "unit_id", "rel_point_id", "process_id",
    "agy_facility_id", "agy_unit_id", "agy_rel_point_id", "agy_process_id", "scc", "poll", "ann_value",
    "ann_pct_red", "facility_name", "erptype", "stkhgt", "stkdiam", "stktemp", "stkflow", "stkvel", "naics",
    "longitude", "latitude", "ll_datum", "horiz_coll_mthd", "design_capacity", "design_capacity_units",
    "reg_codes", "fac_source_type", "unit_type_code", "control_ids", "control_measures", "current_cost",
    "cumulative_cost", "projection_factor", "submitter_id", "calc_method", "data_set_id",
    "facil_category_code", "oris_facility_code", "oris_boiler_id", "ipm_yn", "calc_year", "date_updated",
    "fug_height", "fug_width_xdim", "fug_length_ydim", "fug_angle", "zipcode", "annual_avg_hours_per_year",
    "jan_value", "feb_value", "mar_value", "apr_value", "may_value", "jun_value", "jul_value", "aug_value",
    "sep_value", "oct_value", "nov_value", "dec_value", "jan_pctred", "feb_pctred", "mar_pctred",
    "apr_pctred", "may_pctred", "jun_pctred", "jul_pctred", "aug_pctred", "sep_pctred", "oct_pctred",
    "nov_pctred", "dec_pctred", "comment",
];

pub const MONTH_COLUMNS: [&str; 12] = [
    "jan_value", "feb_value", "mar_value", "apr_value", "may_value", "jun_value", "jul_value", "aug_value",
    "sep_value", "oct_value", "nov_value", "dec_value",
];

// Source descriptors copied onto rows added for new pollutants
const ID_COLUMNS: [&str; 6] = [
    "facility_id", "unit_id", "rel_point_id", "process_id", "oris_facility_code", "oris_boiler_id",
];
const PARAM_COLUMNS: [&str; 20] = [
    "scc", "latitude", "longitude", "erptype", "region_cd", "facility_name", "ipm_yn", "country_cd", "stkhgt",
    "stkvel", "stkflow", "stktemp", "stkdiam", "naics", "fac_source_type", "fug_height", "fug_width_xdim",
    "fug_length_ydim", "fug_angle", "unit_type_code",
];

const HOURLY_LEAD_COLUMNS: [&str; 14] = [
    "country_cd", "region_cd", "tribal_code", "facility_id", "unit_id", "rel_point_id", "process_id", "scc",
    "poll", "op_type_cd", "calc_method", "date_updated", "date", "daytot",
];

type Row = HashMap<String, String>;

fn field<'a>(row: &'a Row, col: &str) -> &'a str {
    row.get(col).map(|s| s.trim()).unwrap_or("")
}

fn parse_value(row: &Row, col: &str) -> Result<Option<f64>> {
    let raw = field(row, col);
    if raw.is_empty() {
        return Ok(None);
    }
    let value = raw
        .parse::<f64>()
        .with_context(|| format!("Bad numeric value '{}' in {}", raw, col))?;
    Ok(Some(value))
}

fn format_value(value: Option<f64>) -> String {
    value.map(|v| round_to(v, 8).to_string()).unwrap_or_default()
}

/// Region and SCC lookups for hourly output rows.
#[derive(Debug, Default)]
pub struct SourceMeta {
    facilities: HashMap<String, (String, String)>, // facility_id -> (country_cd, region_cd)
    sccs: HashMap<(String, String), String>,       // (unit_id, process_id) -> scc
}

impl SourceMeta {
    pub fn region(&self, facility_id: &str) -> Option<&(String, String)> {
        self.facilities.get(facility_id).filter(|(_, region)| !region.is_empty())
    }

    pub fn scc(&self, unit_id: &str, process_id: &str) -> &str {
        self.sccs
            .get(&(unit_id.to_string(), process_id.to_string()))
            .map(String::as_str)
            .unwrap_or("")
    }
}

/// An annual FF10_POINT inventory with every column kept as read.
pub struct AnnualInventory {
    columns: Vec<String>,
    rows: Vec<Row>,
}

impl AnnualInventory {
    pub fn read(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path).with_context(|| format!("Reading annual FF10 {}", path.display()))?;
        let inventory = Self::parse(&text).with_context(|| format!("Parsing annual FF10 {}", path.display()))?;
        info!("Read {} annual FF10 records from {}", inventory.len(), path.display());
        Ok(inventory)
    }

    pub fn parse(text: &str) -> Result<Self> {
        let mut body_start = 0;
        for line in text.split_inclusive('\n') {
            let trimmed = line.trim();
            if trimmed.starts_with('#') || trimmed.is_empty() {
                body_start += line.len();
            } else {
                break;
            }
        }

        let mut reader = ReaderBuilder::new()
            .flexible(true)
            .from_reader(text[body_start..].as_bytes());
        let columns: Vec<String> = reader.headers()?.iter().map(|h| h.trim().to_string()).collect();
        for required in ID_COLUMNS.iter().chain(["poll", "ann_value"].iter()) {
            if !columns.iter().any(|c| c.as_str() == *required) {
                bail!("Annual FF10 is missing column {}", required);
            }
        }

        let mut rows = Vec::new();
        for record in reader.records() {
            let record = record?;
            let row: Row = columns
                .iter()
                .zip(record.iter())
                .map(|(c, v)| (c.clone(), v.to_string()))
                .collect();
            rows.push(row);
        }
        Ok(Self { columns, rows })
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn country(&self) -> String {
        self.rows
            .first()
            .map(|r| field(r, "country_cd").to_string())
            .filter(|c| !c.is_empty())
            .unwrap_or_else(|| "US".to_string())
    }

    /// Inventory records in file order. Pollutant names are upper cased.
    pub fn records(&self) -> Result<Vec<InventoryRecord>> {
        self.rows
            .iter()
            .enumerate()
            .map(|(idx, row)| row_record(row).with_context(|| format!("Annual FF10 data row {}", idx + 1)))
            .collect()
    }

    /// Region for each monitored unit, first row wins.
    pub fn unit_regions(&self) -> BTreeMap<UnitId, String> {
        let mut regions = BTreeMap::new();
        for row in &self.rows {
            let facility = field(row, "oris_facility_code");
            let boiler = field(row, "oris_boiler_id");
            if facility.is_empty() || boiler.is_empty() {
                continue;
            }
            regions
                .entry(UnitId::new(facility, boiler))
                .or_insert_with(|| field(row, "region_cd").to_string());
        }
        regions
    }

    pub fn source_meta(&self) -> SourceMeta {
        let mut meta = SourceMeta::default();
        for row in &self.rows {
            meta.facilities
                .entry(field(row, "facility_id").to_string())
                .or_insert_with(|| (field(row, "country_cd").to_string(), field(row, "region_cd").to_string()));
            meta.sccs
                .entry((field(row, "unit_id").to_string(), field(row, "process_id").to_string()))
                .or_insert_with(|| field(row, "scc").to_string());
        }
        meta
    }

    /// Write the updated annual inventory.
    ///
    /// `updated` must begin with one record per input row, in file order;
    /// anything after that is a new pollutant row and takes its source
    /// descriptors from the first input row of the same source.
    pub fn write_annual(&self, path: &Path, year: i32, updated: &[InventoryRecord]) -> Result<()> {
        let original = self.records()?;
        if updated.len() < original.len() {
            bail!(
                "Updated inventory has {} records, fewer than the {} read",
                updated.len(),
                original.len()
            );
        }

        let mut out_rows: Vec<Row> = Vec::with_capacity(updated.len());
        for ((row, before), after) in self.rows.iter().zip(original.iter()).zip(updated.iter()) {
            let mut row = row.clone();
            if before != after {
                set_values(&mut row, after);
            }
            out_rows.push(row);
        }

        let mut templates: HashMap<(&str, &str, &str, &str), &Row> = HashMap::new();
        for row in &self.rows {
            templates
                .entry((
                    field(row, "facility_id"),
                    field(row, "unit_id"),
                    field(row, "rel_point_id"),
                    field(row, "process_id"),
                ))
                .or_insert(row);
        }
        for record in &updated[original.len()..] {
            let mut row = Row::new();
            let key = (
                record.facility_id.as_str(),
                record.unit_id.as_str(),
                record.rel_point_id.as_str(),
                record.process_id.as_str(),
            );
            if let Some(template) = templates.get(&key) {
                for col in ID_COLUMNS.iter().chain(PARAM_COLUMNS.iter()) {
                    row.insert(col.to_string(), field(template, col).to_string());
                }
            } else {
                warn!("No annual FF10 source row for {:?}; writing ids only", key);
                row.insert("facility_id".to_string(), record.facility_id.clone());
                row.insert("unit_id".to_string(), record.unit_id.clone());
                row.insert("rel_point_id".to_string(), record.rel_point_id.clone());
                row.insert("process_id".to_string(), record.process_id.clone());
            }
            row.insert("poll".to_string(), record.poll.clone());
            set_values(&mut row, record);
            out_rows.push(row);
        }

        let mut file = fs::File::create(path).with_context(|| format!("Creating {}", path.display()))?;
        write!(file, "#FORMAT=FF10_POINT\n#COUNTRY={}\n#YEAR={}\n", self.country(), year)?;
        writeln!(file, "{}", ANNUAL_COLUMNS.join(","))?;
        let mut writer = WriterBuilder::new()
            .has_headers(false)
            .quote_style(QuoteStyle::NonNumeric)
            .from_writer(file);
        for row in &out_rows {
            writer.write_record(ANNUAL_COLUMNS.iter().map(|c| field(row, c)))?;
        }
        writer.flush()?;

        if self.columns.iter().any(|c| !ANNUAL_COLUMNS.contains(&c.as_str())) {
            warn!("Columns outside FF10_POINT were dropped from {}", path.display());
        }
        info!("Wrote {} annual records to {}", out_rows.len(), path.display());
        Ok(())
    }
}

fn row_record(row: &Row) -> Result<InventoryRecord> {
    let facility = field(row, "oris_facility_code");
    let boiler = field(row, "oris_boiler_id");
    let oris = (!facility.is_empty() && !boiler.is_empty()).then(|| UnitId::new(facility, boiler));
    let mut monthly = [None; 12];
    for (slot, col) in monthly.iter_mut().zip(MONTH_COLUMNS.iter()) {
        *slot = parse_value(row, col)?;
    }
    Ok(InventoryRecord {
        facility_id: field(row, "facility_id").to_string(),
        unit_id: field(row, "unit_id").to_string(),
        rel_point_id: field(row, "rel_point_id").to_string(),
        process_id: field(row, "process_id").to_string(),
        oris,
        poll: field(row, "poll").to_uppercase(),
        ann_value: parse_value(row, "ann_value")?,
        monthly,
    })
}

fn set_values(row: &mut Row, record: &InventoryRecord) {
    row.insert("ann_value".to_string(), format_value(record.ann_value));
    for (col, value) in MONTH_COLUMNS.iter().zip(record.monthly.iter()) {
        row.insert(col.to_string(), format_value(*value));
    }
}

/// Write one month of FF10_HOURLY_POINT rows. Rows whose facility has no
/// region are left out and returned as a row count per source.
pub fn write_hourly(
    path: &Path,
    country: &str,
    year: i32,
    profiles: &[DailyProfile<SourceKey>],
    meta: &SourceMeta,
) -> Result<BTreeMap<SourceId, usize>> {
    let mut file = fs::File::create(path).with_context(|| format!("Creating {}", path.display()))?;
    write!(file, "#FORMAT=FF10_HOURLY_POINT\n#COUNTRY={}\n#YEAR={}\n", country, year)?;

    let mut writer = WriterBuilder::new().has_headers(false).from_writer(file);
    let mut header: Vec<String> = HOURLY_LEAD_COLUMNS.iter().map(|c| c.to_string()).collect();
    header.extend((0..HOURS).map(|h| format!("hrval{}", h)));
    header.push("comment".to_string());
    writer.write_record(&header)?;

    let mut dropped: BTreeMap<SourceId, usize> = BTreeMap::new();
    for p in profiles {
        let source = &p.key.source;
        let Some((country_cd, region_cd)) = meta.region(&source.facility_id) else {
            *dropped.entry(source.clone()).or_default() += 1;
            continue;
        };
        let mut record: Vec<String> = vec![
            country_cd.clone(),
            region_cd.clone(),
            String::new(),
            source.facility_id.clone(),
            source.unit_id.clone(),
            source.rel_point_id.clone(),
            source.process_id.clone(),
            meta.scc(&source.unit_id, &source.process_id).to_string(),
            p.key.poll.clone(),
            String::new(),
            String::new(),
            String::new(),
            p.date.format("%Y%m%d").to_string(),
            format_value(Some(p.daytot)),
        ];
        record.extend(p.hrval.iter().map(|v| format_value(Some(*v))));
        record.push(String::new());
        writer.write_record(&record)?;
    }
    writer.flush()?;

    if !dropped.is_empty() {
        warn!(
            "{} hourly rows from {} sources in {} had no region and were not written",
            dropped.values().sum::<usize>(),
            dropped.len(),
            path.display()
        );
    }
    Ok(dropped)
}
