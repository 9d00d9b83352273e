use log::{info, warn};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};

use crate::models::{DailyProfile, MonthlyTotal, ProfileKey, SeriesKey, SourceKey, UnitId};

/// (unit, pollutant, month) rollup key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct MonthKey {
    pub unit: UnitId,
    pub poll: String,
    pub month: u32,
}

impl MonthKey {
    pub fn new(unit: UnitId, poll: impl Into<String>, month: u32) -> Self {
        Self {
            unit,
            poll: poll.into(),
            month,
        }
    }

    pub fn of<K: ProfileKey>(profile: &DailyProfile<K>) -> Self {
        Self::new(profile.key.unit().clone(), profile.key.poll(), profile.month())
    }
}

#[derive(Debug, Default)]
pub struct ScalingOutcome {
    pub profiles: Vec<DailyProfile<SourceKey>>,
    /// Totals whose hourly group summed to zero, so nothing could carry them.
    pub zero_denominator: Vec<MonthlyTotal>,
    /// Hourly groups no total was given for. These are not emitted.
    pub unreconciled: Vec<MonthKey>,
    /// Totals with no hourly group at all.
    pub missing_hourly: Vec<MonthlyTotal>,
}

pub fn monthly_rollup<K: ProfileKey>(profiles: &[DailyProfile<K>]) -> BTreeMap<MonthKey, f64> {
    let mut rollup = BTreeMap::new();
    for p in profiles {
        *rollup.entry(MonthKey::of(p)).or_insert(0.0) += p.daytot;
    }
    rollup
}

/// Scale unit series to each source's authoritative monthly total.
///
/// A group is copied once per total naming it, each copy multiplied by
/// `total / computed`. A zero computed total gives a scalar of zero.
pub fn scale_hourly(profiles: &[DailyProfile<SeriesKey>], totals: &[MonthlyTotal]) -> ScalingOutcome {
    let rollup = monthly_rollup(profiles);
    let mut groups: BTreeMap<MonthKey, Vec<&DailyProfile<SeriesKey>>> = BTreeMap::new();
    for p in profiles {
        groups.entry(MonthKey::of(p)).or_default().push(p);
    }

    let mut outcome = ScalingOutcome::default();
    let mut covered: BTreeSet<&MonthKey> = BTreeSet::new();

    for t in totals {
        let key = MonthKey::new(t.source.unit.clone(), t.poll.as_str(), t.month);
        let Some((group_key, &computed)) = rollup.get_key_value(&key) else {
            outcome.missing_hourly.push(t.clone());
            continue;
        };
        covered.insert(group_key);

        let scalar = if computed == 0.0 {
            if t.total > 0.0 {
                outcome.zero_denominator.push(t.clone());
            }
            0.0
        } else {
            t.total / computed
        };

        for p in groups.get(&key).into_iter().flatten() {
            let mut scaled = p.with_key(SourceKey::new(t.source.clone(), t.poll.as_str()));
            scaled.scale(scalar);
            outcome.profiles.push(scaled);
        }
    }

    outcome.unreconciled = rollup
        .keys()
        .filter(|k| !covered.contains(k))
        .cloned()
        .collect();

    info!(
        "Scaled {} day rows against {} monthly totals",
        outcome.profiles.len(),
        totals.len()
    );
    if !outcome.zero_denominator.is_empty() {
        warn!(
            "{} monthly totals fell on groups with no hourly activity",
            outcome.zero_denominator.len()
        );
    }
    if !outcome.missing_hourly.is_empty() {
        warn!("{} monthly totals have no hourly data", outcome.missing_hourly.len());
    }
    if !outcome.unreconciled.is_empty() {
        warn!(
            "{} hourly unit months have no authoritative total and were dropped",
            outcome.unreconciled.len()
        );
    }
    outcome
}
