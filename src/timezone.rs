use anyhow::{Context, Result};
use cem_engine::UnitId;
use log::{debug, info};
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};
use std::path::Path;

#[derive(Debug, Deserialize)]
struct TimezoneRow {
    region_cd: String,
    lst_offset: f64,
}

/// County FIPS to standard time offset table (`region_cd,tzname,lst_offset`).
pub struct TimezoneTable {
    offsets: HashMap<String, i32>,
}

impl TimezoneTable {
    pub fn read(path: &Path) -> Result<Self> {
        let file = std::fs::File::open(path).with_context(|| format!("Opening timezone table {}", path.display()))?;
        let table = Self::from_reader(file).with_context(|| format!("Parsing timezone table {}", path.display()))?;
        info!("Loaded {} region timezones", table.offsets.len());
        Ok(table)
    }

    pub fn from_reader<R: std::io::Read>(reader: R) -> Result<Self> {
        let mut rdr = csv::ReaderBuilder::new().trim(csv::Trim::All).from_reader(reader);
        let mut offsets = HashMap::new();
        for row in rdr.deserialize::<TimezoneRow>() {
            let row = row?;
            offsets.insert(row.region_cd, row.lst_offset.round() as i32);
        }
        Ok(Self { offsets })
    }

    pub fn offset(&self, region_cd: &str) -> Option<i32> {
        self.offsets.get(region_cd.trim()).copied()
    }

    /// Offsets per monitored unit through the unit's region.
    pub fn unit_offsets(&self, unit_regions: &BTreeMap<UnitId, String>) -> HashMap<UnitId, i32> {
        let offsets: HashMap<UnitId, i32> = unit_regions
            .iter()
            .filter_map(|(unit, region)| self.offset(region).map(|o| (unit.clone(), o)))
            .collect();
        debug!("Resolved offsets for {} of {} units", offsets.len(), unit_regions.len());
        offsets
    }
}
