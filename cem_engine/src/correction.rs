use chrono::Datelike;
use log::{debug, info};
use rayon::prelude::*;
use std::collections::{BTreeMap, HashMap};

use crate::calendar::month_length;
use crate::models::{
    Channel, CorrectionConfig, HourlyReading, MeanKey, MeanSelection, QaEvent, UnitHourMean, UnitId,
};

#[derive(Debug, Default, Clone, Copy)]
struct Accumulator {
    sum: f64,
    count: usize,
}

impl Accumulator {
    fn push(&mut self, value: f64) {
        self.sum += value;
        self.count += 1;
    }

    fn mean(&self) -> Option<f64> {
        if self.count > 0 {
            Some(self.sum / self.count as f64)
        } else {
            None
        }
    }
}

/// Monthly-then-annual fallback means over `records`.
///
/// Every key with at least one record gets an entry when either level has a
/// value. `sample` yields the value a record contributes, if any.
fn fallback_means<'a, I, F>(records: I, threshold: f64, sample: F) -> HashMap<MeanKey, MeanSelection>
where
    I: IntoIterator<Item = &'a HourlyReading>,
    F: Fn(&HourlyReading) -> Option<f64>,
{
    let mut monthly: HashMap<MeanKey, (Accumulator, u32)> = HashMap::new();
    let mut annual: HashMap<(UnitId, u32), Accumulator> = HashMap::new();

    for r in records {
        let (acc, _) = monthly
            .entry(MeanKey::of(r))
            .or_insert_with(|| (Accumulator::default(), month_length(r.date())));
        if let Some(value) = sample(r) {
            acc.push(value);
            annual.entry((r.unit.clone(), r.hour())).or_default().push(value);
        }
    }

    monthly
        .into_iter()
        .filter_map(|(key, (acc, days))| {
            let frac = acc.count as f64 / days as f64;
            let selection = if frac >= threshold {
                MeanSelection::MonthlyMean { value: acc.mean()? }
            } else {
                let value = annual.get(&(key.unit.clone(), key.hour))?.mean()?;
                MeanSelection::AnnualFallback { value }
            };
            Some((key, selection))
        })
        .collect()
}

fn is_trusted(reading: &HourlyReading, channel: Channel) -> bool {
    reading
        .quality
        .for_channel(channel)
        .map_or(false, |code| code.is_trusted())
}

/// Per channel fallback means and mass rates. Built once, read afterwards.
#[derive(Debug, Default, Clone)]
pub struct MeanTable {
    means: HashMap<Channel, HashMap<MeanKey, MeanSelection>>,
    rates: HashMap<Channel, HashMap<MeanKey, MeanSelection>>,
}

impl MeanTable {
    pub fn mean_selection(&self, channel: Channel, key: &MeanKey) -> Option<&MeanSelection> {
        self.means.get(&channel)?.get(key)
    }

    pub fn rate_selection(&self, channel: Channel, key: &MeanKey) -> Option<&MeanSelection> {
        self.rates.get(&channel)?.get(key)
    }

    pub fn mean(&self, channel: Channel, key: &MeanKey) -> Option<f64> {
        self.mean_selection(channel, key).map(MeanSelection::value)
    }

    pub fn rate(&self, channel: Channel, key: &MeanKey) -> Option<f64> {
        self.rate_selection(channel, key).map(MeanSelection::value)
    }

    pub fn len(&self) -> usize {
        self.means.values().map(HashMap::len).sum::<usize>() + self.rates.values().map(HashMap::len).sum::<usize>()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// (monthly, annual fallback) counts across means and rates.
    pub fn selection_counts(&self) -> (usize, usize) {
        self.means
            .values()
            .chain(self.rates.values())
            .flat_map(|m| m.values())
            .fold((0, 0), |(monthly, annual), s| {
                if s.is_monthly() {
                    (monthly + 1, annual)
                } else {
                    (monthly, annual + 1)
                }
            })
    }

    /// Flattened rows, one per (channel, key), sorted.
    pub fn rows(&self) -> Vec<UnitHourMean> {
        let mut keys: Vec<(Channel, &MeanKey)> = self
            .means
            .iter()
            .chain(self.rates.iter())
            .flat_map(|(channel, m)| m.keys().map(move |k| (*channel, k)))
            .collect();
        keys.sort();
        keys.dedup();

        keys.into_iter()
            .map(|(channel, key)| UnitHourMean {
                key: key.clone(),
                channel,
                mean: self.mean_selection(channel, key).copied(),
                rate: self.rate_selection(channel, key).copied(),
            })
            .collect()
    }

    pub fn merge(&mut self, other: MeanTable) {
        for (channel, m) in other.means {
            self.means.entry(channel).or_default().extend(m);
        }
        for (channel, m) in other.rates {
            self.rates.entry(channel).or_default().extend(m);
        }
    }
}

/// Replace flagged values that exceed `expected * peak_factor`, logging each one.
fn replace_anomalies<F>(
    channel: Channel,
    readings: &mut [HourlyReading],
    peak_factor: f64,
    qa: &mut Vec<QaEvent>,
    expected: F,
) -> usize
where
    F: Fn(&MeanKey) -> f64,
{
    let mut replaced = 0;
    for r in readings.iter_mut() {
        let Some(value) = r.value(channel) else {
            continue;
        };
        if !r.quality.any_flagged() {
            continue;
        }
        let mean = expected(&MeanKey::of(r));
        if mean > 0.0 && value > mean * peak_factor {
            qa.push(QaEvent {
                unit: r.unit.clone(),
                timestamp: r.timestamp,
                field: channel,
                measurement_code: r.quality.for_channel(channel).unwrap_or_default(),
                original_value: value,
                replacement_value: mean,
            });
            r.set_value(channel, Some(mean));
            replaced += 1;
        }
    }
    replaced
}

/// Owns the mean table and QA log for one correction pass.
pub struct CorrectionContext {
    config: CorrectionConfig,
    means: MeanTable,
    qa: Vec<QaEvent>,
}

impl CorrectionContext {
    pub fn new(config: CorrectionConfig) -> Self {
        Self {
            config,
            means: MeanTable::default(),
            qa: Vec::new(),
        }
    }

    pub fn means(&self) -> &MeanTable {
        &self.means
    }

    pub fn qa_events(&self) -> &[QaEvent] {
        &self.qa
    }

    pub fn into_parts(self) -> (MeanTable, Vec<QaEvent>) {
        (self.means, self.qa)
    }

    /// Unit-hour means of trusted values for `channel`.
    pub fn calc_mean(&mut self, channel: Channel, readings: &[HourlyReading]) {
        let trusted = readings.iter().filter(|r| is_trusted(r, channel));
        let means = fallback_means(trusted, self.config.threshold, |r| r.value(channel));
        debug!("{} means for {} unit hours", channel, means.len());
        self.means.means.insert(channel, means);
    }

    /// Unit-hour mean rate (mass per heat input) for a mass channel.
    ///
    /// Heat input that is missing, zero, or flagged and above
    /// `heat_substitution_factor` times its mean is swapped for the mean
    /// before dividing.
    pub fn calc_rate(&mut self, channel: Channel, readings: &[HourlyReading]) {
        let heat_limit = self.config.heat_substitution_factor;
        let table = &self.means;
        let trusted = readings.iter().filter(|r| is_trusted(r, channel));
        let rates = fallback_means(trusted, self.config.threshold, |r| {
            let heat_mean = table.mean(Channel::HeatInput, &MeanKey::of(r));
            let heat = r.heat_input.unwrap_or(0.0);
            let flagged_high = r.quality.heat_input.is_flagged() && heat_mean.map_or(false, |m| heat > m * heat_limit);
            let heat = if heat == 0.0 || flagged_high { heat_mean? } else { heat };
            let rate = r.value(channel).unwrap_or(0.0) / heat;
            (rate.is_finite() && rate > 0.0).then_some(rate)
        });
        debug!("{} rates for {} unit hours", channel, rates.len());
        self.means.rates.insert(channel, rates);
    }

    /// Replace anomalous values of `channel` with its mean.
    pub fn fill_mean(&mut self, channel: Channel, readings: &mut [HourlyReading]) -> usize {
        let means = &self.means;
        replace_anomalies(channel, readings, self.config.peak_factor, &mut self.qa, |key| {
            means.mean(channel, key).unwrap_or(0.0)
        })
    }

    /// Replace anomalous values of a mass channel with rate times mean heat input.
    pub fn fill_rate(&mut self, channel: Channel, readings: &mut [HourlyReading]) -> usize {
        let means = &self.means;
        replace_anomalies(channel, readings, self.config.peak_factor, &mut self.qa, |key| {
            means.rate(channel, key).unwrap_or(0.0) * means.mean(Channel::HeatInput, key).unwrap_or(0.0)
        })
    }

    /// Means for every corrected channel, then heat input, then each mass channel.
    pub fn run(&mut self, readings: &mut [HourlyReading]) {
        for channel in Channel::CORRECTED {
            self.calc_mean(channel, readings);
        }
        let replaced = self.fill_mean(Channel::HeatInput, readings);
        debug!("Replaced {} heat input values", replaced);

        for channel in Channel::CORRECTED.into_iter().filter(|c| c.is_mass()) {
            self.calc_rate(channel, readings);
            let replaced = self.fill_rate(channel, readings);
            debug!("Replaced {} {} values", replaced, channel);
        }
    }

    pub fn merge(&mut self, other: CorrectionContext) {
        let (means, qa) = other.into_parts();
        self.means.merge(means);
        self.qa.extend(qa);
    }
}

pub struct CorrectionOutcome {
    pub readings: Vec<HourlyReading>,
    pub means: MeanTable,
    pub qa: Vec<QaEvent>,
}

/// Correct readings unit by unit in parallel. Output is sorted by unit then timestamp.
pub fn correct_readings(readings: Vec<HourlyReading>, config: &CorrectionConfig) -> CorrectionOutcome {
    let mut shards: BTreeMap<UnitId, Vec<HourlyReading>> = BTreeMap::new();
    for r in readings {
        shards.entry(r.unit.clone()).or_default().push(r);
    }
    let shards: Vec<Vec<HourlyReading>> = shards.into_values().collect();
    let unit_count = shards.len();

    let results: Vec<(Vec<HourlyReading>, CorrectionContext)> = shards
        .into_par_iter()
        .map(|mut shard| {
            shard.sort_by_key(|r| r.timestamp);
            let mut ctx = CorrectionContext::new(config.clone());
            ctx.run(&mut shard);
            (shard, ctx)
        })
        .collect();

    let mut merged = CorrectionContext::new(config.clone());
    let mut corrected = Vec::new();
    for (shard, ctx) in results {
        corrected.extend(shard);
        merged.merge(ctx);
    }

    let (means, qa) = merged.into_parts();
    let (monthly, annual) = means.selection_counts();
    info!(
        "Corrected {} values across {} units ({} monthly means, {} annual fallbacks)",
        qa.len(),
        unit_count,
        monthly,
        annual
    );

    CorrectionOutcome {
        readings: corrected,
        means,
        qa,
    }
}

/// Order QA events for reporting: unit, timestamp, field.
pub fn sort_qa_events(events: &mut [QaEvent]) {
    events.sort_by(|a, b| {
        (&a.unit, a.timestamp, a.field.label()).cmp(&(&b.unit, b.timestamp, b.field.label()))
    });
}

/// Year, month and day of a QA event, the way the QA log reports them.
pub fn qa_event_date_parts(event: &QaEvent) -> (i32, u32, u32) {
    let date = event.timestamp.date();
    (date.year(), date.month(), date.day())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{QualityCode, QualityFlags};
    use chrono::{NaiveDate, NaiveDateTime};

    fn ts(m: u32, d: u32, h: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2016, m, d).unwrap().and_hms_opt(h, 0, 0).unwrap()
    }

    fn unit() -> UnitId {
        UnitId::new("3", "1")
    }

    fn measured(m: u32, d: u32, heat: f64, nox: f64) -> HourlyReading {
        HourlyReading::new(unit(), ts(m, d, 0))
            .with_value(Channel::HeatInput, heat)
            .with_value(Channel::Nox, nox)
            .with_quality(QualityFlags::all(QualityCode::Measured))
    }

    #[test]
    fn test_monthly_mean_vs_annual_fallback() {
        let mut readings = Vec::new();
        // 10 of 31 January days is above the 0.3 threshold
        for d in 1..=10 {
            readings.push(measured(1, d, 100.0, 1.0));
        }
        // 5 of 29 February days is not
        for d in 1..=5 {
            readings.push(measured(2, d, 200.0, 1.0));
        }

        let mut ctx = CorrectionContext::new(CorrectionConfig::default());
        ctx.calc_mean(Channel::HeatInput, &readings);

        let jan = ctx.means().mean_selection(Channel::HeatInput, &MeanKey::new(unit(), 0, 1)).unwrap();
        assert_eq!(*jan, MeanSelection::MonthlyMean { value: 100.0 });

        let feb = ctx.means().mean_selection(Channel::HeatInput, &MeanKey::new(unit(), 0, 2)).unwrap();
        match feb {
            MeanSelection::AnnualFallback { value } => assert!((value - 2000.0 / 15.0).abs() < 1e-9),
            other => panic!("expected annual fallback, got {:?}", other),
        }
    }

    #[test]
    fn test_threshold_is_inclusive() {
        // 9 of 30 April days is exactly 0.3
        let readings: Vec<_> = (1..=9).map(|d| measured(4, d, 100.0, 1.0)).collect();

        let mut ctx = CorrectionContext::new(CorrectionConfig::default());
        ctx.calc_mean(Channel::HeatInput, &readings);

        let apr = ctx.means().mean_selection(Channel::HeatInput, &MeanKey::new(unit(), 0, 4)).unwrap();
        assert_eq!(*apr, MeanSelection::MonthlyMean { value: 100.0 });
    }

    #[test]
    fn test_sparse_month_rate_falls_back_to_annual() {
        let mut readings: Vec<_> = (1..=20).map(|d| measured(4, d, 100.0, 10.0)).collect();
        readings.extend((1..=2).map(|d| measured(5, d, 100.0, 50.0)));

        let mut ctx = CorrectionContext::new(CorrectionConfig::default());
        ctx.calc_mean(Channel::HeatInput, &readings);
        ctx.calc_rate(Channel::Nox, &readings);

        let apr = ctx.means().rate_selection(Channel::Nox, &MeanKey::new(unit(), 0, 4)).unwrap();
        assert!(apr.is_monthly());
        assert!((apr.value() - 0.1).abs() < 1e-12);

        // 20 days at 0.1 and 2 days at 0.5 pooled over the year
        let may = ctx.means().rate_selection(Channel::Nox, &MeanKey::new(unit(), 0, 5)).unwrap();
        match may {
            MeanSelection::AnnualFallback { value } => assert!((value - 3.0 / 22.0).abs() < 1e-12),
            other => panic!("expected annual fallback, got {:?}", other),
        }
    }

    #[test]
    fn test_untrusted_values_excluded_from_mean() {
        let mut readings: Vec<_> = (1..=20).map(|d| measured(1, d, 100.0, 1.0)).collect();
        readings.push(
            HourlyReading::new(unit(), ts(1, 21, 0))
                .with_value(Channel::HeatInput, 10_000.0)
                .with_quality(QualityFlags::all(QualityCode::Substitute)),
        );

        let mut ctx = CorrectionContext::new(CorrectionConfig::default());
        ctx.calc_mean(Channel::HeatInput, &readings);
        assert_eq!(ctx.means().mean(Channel::HeatInput, &MeanKey::new(unit(), 0, 1)), Some(100.0));
    }

    #[test]
    fn test_substitute_heat_input_replaced() {
        let mut readings: Vec<_> = (1..=20).map(|d| measured(1, d, 100.0, 1.0)).collect();
        let mut flags = QualityFlags::all(QualityCode::Measured);
        flags.heat_input = QualityCode::Substitute;
        readings.push(
            HourlyReading::new(unit(), ts(1, 21, 0))
                .with_value(Channel::HeatInput, 500.0)
                .with_quality(flags),
        );

        let mut ctx = CorrectionContext::new(CorrectionConfig::default());
        ctx.calc_mean(Channel::HeatInput, &readings);
        let replaced = ctx.fill_mean(Channel::HeatInput, &mut readings);

        assert_eq!(replaced, 1);
        assert_eq!(readings[20].heat_input, Some(100.0));
        let event = &ctx.qa_events()[0];
        assert_eq!(event.field, Channel::HeatInput);
        assert_eq!(event.measurement_code, QualityCode::Substitute);
        assert_eq!(event.original_value, 500.0);
        assert_eq!(event.replacement_value, 100.0);
    }

    #[test]
    fn test_measured_value_never_replaced() {
        let mut readings: Vec<_> = (1..=20).map(|d| measured(1, d, 100.0, 10.0)).collect();
        readings.push(measured(1, 21, 100.0, 1000.0));

        let mut ctx = CorrectionContext::new(CorrectionConfig::default());
        ctx.run(&mut readings);

        assert_eq!(readings[20].nox, Some(1000.0));
        assert!(ctx.qa_events().is_empty());
    }

    #[test]
    fn test_rate_uses_mean_heat_for_flagged_spike() {
        let mut readings: Vec<_> = (1..=20).map(|d| measured(1, d, 100.0, 50.0)).collect();
        let mut flags = QualityFlags::all(QualityCode::Measured);
        flags.heat_input = QualityCode::Substitute;
        readings.push(
            HourlyReading::new(unit(), ts(1, 21, 0))
                .with_value(Channel::HeatInput, 1000.0)
                .with_value(Channel::Nox, 50.0)
                .with_quality(flags),
        );

        let mut ctx = CorrectionContext::new(CorrectionConfig::default());
        ctx.calc_mean(Channel::HeatInput, &readings);
        ctx.calc_rate(Channel::Nox, &readings);

        let rate = ctx.means().rate(Channel::Nox, &MeanKey::new(unit(), 0, 1)).unwrap();
        assert!((rate - 0.5).abs() < 1e-12);
    }

    #[test]
    fn test_mass_replaced_with_rate_times_heat() {
        let mut readings: Vec<_> = (1..=20).map(|d| measured(1, d, 100.0, 50.0)).collect();
        let mut flags = QualityFlags::all(QualityCode::Measured);
        flags.nox = QualityCode::Substitute;
        readings.push(
            HourlyReading::new(unit(), ts(1, 22, 0))
                .with_value(Channel::HeatInput, 100.0)
                .with_value(Channel::Nox, 500.0)
                .with_quality(flags),
        );

        let mut ctx = CorrectionContext::new(CorrectionConfig::default());
        ctx.run(&mut readings);

        assert_eq!(readings[20].nox, Some(50.0));
        assert_eq!(ctx.qa_events().len(), 1);
        assert_eq!(ctx.qa_events()[0].field, Channel::Nox);
        assert_eq!(ctx.qa_events()[0].measurement_code, QualityCode::Substitute);
    }

    #[test]
    fn test_missing_mean_leaves_value() {
        let mut readings = vec![HourlyReading::new(unit(), ts(3, 1, 4))
            .with_value(Channel::HeatInput, 9_999.0)
            .with_quality(QualityFlags::all(QualityCode::Other))];

        let mut ctx = CorrectionContext::new(CorrectionConfig::default());
        ctx.run(&mut readings);

        assert_eq!(readings[0].heat_input, Some(9_999.0));
        assert!(ctx.qa_events().is_empty());
    }

    #[test]
    fn test_correction_is_idempotent() {
        let mut readings: Vec<_> = (1..=20).map(|d| measured(1, d, 100.0, 50.0)).collect();
        let mut flags = QualityFlags::all(QualityCode::Measured);
        flags.heat_input = QualityCode::Substitute;
        flags.nox = QualityCode::Substitute;
        readings.push(
            HourlyReading::new(unit(), ts(1, 21, 0))
                .with_value(Channel::HeatInput, 900.0)
                .with_value(Channel::Nox, 900.0)
                .with_quality(flags),
        );

        let first = correct_readings(readings, &CorrectionConfig::default());
        assert_eq!(first.qa.len(), 2);

        let second = correct_readings(first.readings.clone(), &CorrectionConfig::default());
        assert!(second.qa.is_empty());
        assert_eq!(second.readings, first.readings);
    }

    #[test]
    fn test_sharded_matches_single_context() {
        let other = UnitId::new("7", "B2");
        let mut readings: Vec<_> = (1..=20).map(|d| measured(1, d, 100.0, 50.0)).collect();
        for d in 1..=20 {
            readings.push(
                HourlyReading::new(other.clone(), ts(1, d, 0))
                    .with_value(Channel::HeatInput, 40.0)
                    .with_quality(QualityFlags::all(QualityCode::Calculated)),
            );
        }
        let mut flags = QualityFlags::all(QualityCode::Measured);
        flags.heat_input = QualityCode::Lme;
        readings.push(
            HourlyReading::new(other.clone(), ts(1, 25, 0))
                .with_value(Channel::HeatInput, 400.0)
                .with_quality(flags),
        );

        let mut sequential = readings.clone();
        let mut ctx = CorrectionContext::new(CorrectionConfig::default());
        ctx.run(&mut sequential);

        let sharded = correct_readings(readings, &CorrectionConfig::default());
        assert_eq!(sharded.qa, ctx.qa_events());
        assert_eq!(sharded.means.rows(), ctx.means().rows());
        let fixed = sharded.readings.iter().find(|r| r.unit == other && r.timestamp == ts(1, 25, 0)).unwrap();
        assert_eq!(fixed.heat_input, Some(40.0));
    }
}
