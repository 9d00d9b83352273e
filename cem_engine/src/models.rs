use chrono::{Datelike, NaiveDate, NaiveDateTime, Timelike};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::hash::Hash;

pub const HOURS: usize = 24;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CorrectionConfig {
    pub peak_factor: f64,              // value / mean ratio above which a flagged value is replaced
    pub threshold: f64,                // min fraction of month days with trusted data for a monthly mean
    pub heat_substitution_factor: f64, // flagged heat input above this multiple of its mean is not used in rates
}

impl Default for CorrectionConfig {
    fn default() -> Self {
        Self {
            peak_factor: 3.0,
            threshold: 0.3,
            heat_substitution_factor: 2.0,
        }
    }
}

/// Facility/boiler pair identifying one monitored unit.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct UnitId {
    pub facility: String,
    pub boiler: String,
}

impl UnitId {
    pub fn new(facility: impl Into<String>, boiler: impl Into<String>) -> Self {
        Self {
            facility: facility.into().trim().to_string(),
            boiler: boiler.into().trim().to_string(),
        }
    }
}

impl fmt::Display for UnitId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.facility, self.boiler)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum QualityCode {
    #[default]
    Unknown = 0,
    Measured = 1,
    Calculated = 2,
    Substitute = 3,
    MeasuredAndSubstitute = 4,
    Lme = 5,
    Other = 6,
}

impl QualityCode {
    /// Map a CAMD measure indicator label to its code. Blank or unrecognised labels are Unknown.
    pub fn from_label(label: &str) -> Self {
        match label.trim() {
            "Measured" => QualityCode::Measured,
            "Calculated" => QualityCode::Calculated,
            "Substitute" => QualityCode::Substitute,
            "Measured and Substitute" => QualityCode::MeasuredAndSubstitute,
            "LME" => QualityCode::Lme,
            "Other" => QualityCode::Other,
            _ => QualityCode::Unknown,
        }
    }

    pub fn from_code(code: u8) -> Self {
        match code {
            1 => QualityCode::Measured,
            2 => QualityCode::Calculated,
            3 => QualityCode::Substitute,
            4 => QualityCode::MeasuredAndSubstitute,
            5 => QualityCode::Lme,
            6 => QualityCode::Other,
            _ => QualityCode::Unknown,
        }
    }

    pub fn code(self) -> u8 {
        self as u8
    }

    pub fn is_trusted(self) -> bool {
        matches!(self, QualityCode::Measured | QualityCode::Calculated)
    }

    pub fn is_flagged(self) -> bool {
        self.code() > 2
    }
}

/// Value columns carried by an hourly reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Channel {
    GrossLoad,
    SteamLoad,
    HeatInput,
    So2,
    Co2,
    Nox,
    OpTime,
}

impl Channel {
    pub const VALUE_CHANNELS: [Channel; 7] = [
        Channel::GrossLoad,
        Channel::SteamLoad,
        Channel::HeatInput,
        Channel::So2,
        Channel::Co2,
        Channel::Nox,
        Channel::OpTime,
    ];

    /// Channels with a measure indicator, heat input first.
    pub const CORRECTED: [Channel; 4] = [Channel::HeatInput, Channel::Nox, Channel::So2, Channel::Co2];

    pub fn label(self) -> &'static str {
        match self {
            Channel::GrossLoad => "GLOAD",
            Channel::SteamLoad => "SLOAD",
            Channel::HeatInput => "HTINPUT",
            Channel::So2 => "SO2",
            Channel::Co2 => "CO2",
            Channel::Nox => "NOX",
            Channel::OpTime => "OPTIME",
        }
    }

    pub fn from_label(label: &str) -> Option<Self> {
        Channel::VALUE_CHANNELS
            .iter()
            .copied()
            .find(|c| c.label().eq_ignore_ascii_case(label.trim()))
    }

    pub fn is_mass(self) -> bool {
        matches!(self, Channel::So2 | Channel::Co2 | Channel::Nox)
    }

    /// NOx and SO2 are reported in lbs; inventories carry short tons.
    pub fn to_inventory_units(self, value: f64) -> f64 {
        match self {
            Channel::So2 | Channel::Nox => value / 2000.0,
            _ => value,
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// The five measure indicators of a reading.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QualityFlags {
    pub heat_input: QualityCode,
    pub nox: QualityCode,
    pub so2: QualityCode,
    pub co2: QualityCode,
    pub nox_rate: QualityCode,
}

impl QualityFlags {
    pub fn all(code: QualityCode) -> Self {
        Self {
            heat_input: code,
            nox: code,
            so2: code,
            co2: code,
            nox_rate: code,
        }
    }

    pub fn for_channel(&self, channel: Channel) -> Option<QualityCode> {
        match channel {
            Channel::HeatInput => Some(self.heat_input),
            Channel::Nox => Some(self.nox),
            Channel::So2 => Some(self.so2),
            Channel::Co2 => Some(self.co2),
            Channel::GrossLoad | Channel::SteamLoad | Channel::OpTime => None,
        }
    }

    pub fn set_channel(&mut self, channel: Channel, code: QualityCode) {
        match channel {
            Channel::HeatInput => self.heat_input = code,
            Channel::Nox => self.nox = code,
            Channel::So2 => self.so2 = code,
            Channel::Co2 => self.co2 = code,
            Channel::GrossLoad | Channel::SteamLoad | Channel::OpTime => {}
        }
    }

    pub fn any_flagged(&self) -> bool {
        [self.heat_input, self.nox, self.so2, self.co2, self.nox_rate]
            .iter()
            .any(|c| c.is_flagged())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HourlyReading {
    pub unit: UnitId,
    pub timestamp: NaiveDateTime,
    pub gross_load: Option<f64>,
    pub steam_load: Option<f64>,
    pub heat_input: Option<f64>,
    pub so2: Option<f64>,  // lbs
    pub co2: Option<f64>,  // short tons
    pub nox: Option<f64>,  // lbs
    pub op_time: Option<f64>,
    pub nox_rate: Option<f64>, // lbs/mmBtu
    pub quality: QualityFlags,
}

impl HourlyReading {
    pub fn new(unit: UnitId, timestamp: NaiveDateTime) -> Self {
        Self {
            unit,
            timestamp,
            gross_load: None,
            steam_load: None,
            heat_input: None,
            so2: None,
            co2: None,
            nox: None,
            op_time: None,
            nox_rate: None,
            quality: QualityFlags::default(),
        }
    }

    pub fn with_value(mut self, channel: Channel, value: f64) -> Self {
        self.set_value(channel, Some(value));
        self
    }

    pub fn with_quality(mut self, quality: QualityFlags) -> Self {
        self.quality = quality;
        self
    }

    pub fn date(&self) -> NaiveDate {
        self.timestamp.date()
    }

    pub fn hour(&self) -> u32 {
        self.timestamp.hour()
    }

    pub fn month(&self) -> u32 {
        self.timestamp.month()
    }

    pub fn value(&self, channel: Channel) -> Option<f64> {
        match channel {
            Channel::GrossLoad => self.gross_load,
            Channel::SteamLoad => self.steam_load,
            Channel::HeatInput => self.heat_input,
            Channel::So2 => self.so2,
            Channel::Co2 => self.co2,
            Channel::Nox => self.nox,
            Channel::OpTime => self.op_time,
        }
    }

    pub fn set_value(&mut self, channel: Channel, value: Option<f64>) {
        let slot = match channel {
            Channel::GrossLoad => &mut self.gross_load,
            Channel::SteamLoad => &mut self.steam_load,
            Channel::HeatInput => &mut self.heat_input,
            Channel::So2 => &mut self.so2,
            Channel::Co2 => &mut self.co2,
            Channel::Nox => &mut self.nox,
            Channel::OpTime => &mut self.op_time,
        };
        *slot = value;
    }
}

/// Grouping key for the fallback means: (unit, hour of day, month).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MeanKey {
    pub unit: UnitId,
    pub hour: u32,
    pub month: u32,
}

impl MeanKey {
    pub fn new(unit: UnitId, hour: u32, month: u32) -> Self {
        Self { unit, hour, month }
    }

    pub fn of(reading: &HourlyReading) -> Self {
        Self::new(reading.unit.clone(), reading.hour(), reading.month())
    }
}

/// Which level of the fallback produced a mean.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum MeanSelection {
    MonthlyMean { value: f64 },
    AnnualFallback { value: f64 },
}

impl MeanSelection {
    pub fn value(&self) -> f64 {
        match self {
            MeanSelection::MonthlyMean { value } | MeanSelection::AnnualFallback { value } => *value,
        }
    }

    pub fn is_monthly(&self) -> bool {
        matches!(self, MeanSelection::MonthlyMean { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnitHourMean {
    pub key: MeanKey,
    pub channel: Channel,
    pub mean: Option<MeanSelection>,
    pub rate: Option<MeanSelection>, // mass channels only
}

/// One replaced value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QaEvent {
    pub unit: UnitId,
    pub timestamp: NaiveDateTime,
    pub field: Channel,
    pub measurement_code: QualityCode,
    pub original_value: f64,
    pub replacement_value: f64,
}

/// Inventory source identifiers, tied to the monitored unit they report for.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SourceId {
    pub facility_id: String,
    pub unit_id: String,
    pub rel_point_id: String,
    pub process_id: String,
    pub unit: UnitId,
}

/// One row of the annual inventory as read from file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InventoryRecord {
    pub facility_id: String,
    pub unit_id: String,
    pub rel_point_id: String,
    pub process_id: String,
    pub oris: Option<UnitId>,
    pub poll: String,
    pub ann_value: Option<f64>,
    pub monthly: [Option<f64>; 12],
}

impl InventoryRecord {
    /// Records without ORIS facility/boiler ids cannot be tied to monitoring data.
    pub fn source(&self) -> Option<SourceId> {
        self.oris.as_ref().map(|unit| SourceId {
            facility_id: self.facility_id.clone(),
            unit_id: self.unit_id.clone(),
            rel_point_id: self.rel_point_id.clone(),
            process_id: self.process_id.clone(),
            unit: unit.clone(),
        })
    }

    pub fn has_monthly(&self) -> bool {
        self.monthly.iter().map(|v| v.unwrap_or(0.0)).sum::<f64>() > 0.0
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnnualEmissionRecord {
    pub source: SourceId,
    pub poll: String,
    pub ann_value: f64,
    pub monthly: Option<[f64; 12]>,
    pub unit_frac: f64, // share of the unit's annual mass for this poll
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonthlyTotal {
    pub source: SourceId,
    pub poll: String,
    pub month: u32,
    pub total: f64,
}

pub trait ProfileKey: Clone + Eq + Hash + Ord {
    fn unit(&self) -> &UnitId;
    fn poll(&self) -> &str;
}

/// Unit level series key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SeriesKey {
    pub unit: UnitId,
    pub poll: String,
}

impl SeriesKey {
    pub fn new(unit: UnitId, poll: impl Into<String>) -> Self {
        Self { unit, poll: poll.into() }
    }
}

impl ProfileKey for SeriesKey {
    fn unit(&self) -> &UnitId {
        &self.unit
    }

    fn poll(&self) -> &str {
        &self.poll
    }
}

/// Source level series key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SourceKey {
    pub source: SourceId,
    pub poll: String,
}

impl SourceKey {
    pub fn new(source: SourceId, poll: impl Into<String>) -> Self {
        Self { source, poll: poll.into() }
    }
}

impl ProfileKey for SourceKey {
    fn unit(&self) -> &UnitId {
        &self.source.unit
    }

    fn poll(&self) -> &str {
        &self.poll
    }
}

/// A day of hourly values for one series.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DailyProfile<K> {
    pub key: K,
    pub date: NaiveDate,
    pub daytot: f64,
    pub hrval: [f64; HOURS],
}

impl<K> DailyProfile<K> {
    pub fn zero(key: K, date: NaiveDate) -> Self {
        Self {
            key,
            date,
            daytot: 0.0,
            hrval: [0.0; HOURS],
        }
    }

    pub fn from_hours(key: K, date: NaiveDate, hrval: [f64; HOURS]) -> Self {
        Self {
            key,
            date,
            daytot: hrval.iter().sum(),
            hrval,
        }
    }

    pub fn month(&self) -> u32 {
        self.date.month()
    }

    pub fn scale(&mut self, factor: f64) {
        self.daytot *= factor;
        for v in self.hrval.iter_mut() {
            *v *= factor;
        }
    }

    pub fn accumulate(&mut self, other: &DailyProfile<K>) {
        self.daytot += other.daytot;
        for (v, o) in self.hrval.iter_mut().zip(other.hrval.iter()) {
            *v += o;
        }
    }

    pub fn with_key<J>(&self, key: J) -> DailyProfile<J> {
        DailyProfile {
            key,
            date: self.date,
            daytot: self.daytot,
            hrval: self.hrval,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TemporalFactor {
    pub unit: UnitId,
    pub month: u32,
    pub date: NaiveDate,
    pub dayfrac: f64,
    pub hourfrac: [f64; HOURS],
    // activity values the fractions were taken from
    pub daytot: f64,
    pub hrval: [f64; HOURS],
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CalendarEntry<K> {
    pub key: K,
    pub date: NaiveDate,
}
