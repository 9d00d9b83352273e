use log::{info, warn};
use std::collections::{BTreeMap, BTreeSet, HashMap};

use crate::models::{
    AnnualEmissionRecord, DailyProfile, SeriesKey, SourceId, SourceKey, TemporalFactor, UnitId, HOURS,
};

pub const DEFAULT_HIERARCHY: [&str; 4] = ["HTINPUT", "GLOAD", "SLOAD", "NOX"];
pub const DEFAULT_ACTIVITY_LABEL: &str = "HOURACT";

/// Unit activity shapes and the pollutant each one was drawn from.
#[derive(Debug, Default)]
pub struct TemporalProfile {
    pub factors: Vec<TemporalFactor>,
    pub selection: BTreeMap<UnitId, String>,
    pub unresolved: Vec<UnitId>,
}

#[derive(Debug, Default)]
pub struct Allocation {
    pub profiles: Vec<DailyProfile<SourceKey>>,
    pub unmatched: Vec<UnitId>,
}

pub struct TemporalAllocator {
    hierarchy: Vec<String>,
    activity_label: String,
}

impl TemporalAllocator {
    pub fn new(activity_label: impl Into<String>) -> Self {
        Self {
            hierarchy: DEFAULT_HIERARCHY.iter().map(|s| s.to_string()).collect(),
            activity_label: activity_label.into(),
        }
    }

    pub fn with_hierarchy(mut self, hierarchy: Vec<String>) -> Self {
        self.hierarchy = hierarchy;
        self
    }

    pub fn activity_label(&self) -> &str {
        &self.activity_label
    }

    /// First pollutant in the hierarchy with a positive annual total, per unit.
    pub fn select_representative(
        &self,
        annual_totals: &BTreeMap<SeriesKey, f64>,
    ) -> (BTreeMap<UnitId, String>, Vec<UnitId>) {
        let units: BTreeSet<&UnitId> = annual_totals.keys().map(|k| &k.unit).collect();
        let mut selection = BTreeMap::new();
        let mut unresolved = Vec::new();

        for unit in units {
            let chosen = self.hierarchy.iter().find(|poll| {
                annual_totals
                    .get(&SeriesKey::new(unit.clone(), poll.as_str()))
                    .map_or(false, |total| *total > 0.0)
            });
            match chosen {
                Some(poll) => {
                    selection.insert(unit.clone(), poll.clone());
                }
                None => unresolved.push(unit.clone()),
            }
        }
        (selection, unresolved)
    }

    /// Daily and hourly fractions of each unit's annual activity.
    pub fn calc_factors(&self, profiles: &[DailyProfile<SeriesKey>]) -> TemporalProfile {
        let mut annual_totals: BTreeMap<SeriesKey, f64> = BTreeMap::new();
        for p in profiles {
            *annual_totals.entry(p.key.clone()).or_insert(0.0) += p.daytot;
        }

        let (selection, unresolved) = self.select_representative(&annual_totals);
        if !unresolved.is_empty() {
            let listing: Vec<String> = unresolved.iter().map(|u| u.to_string()).collect();
            warn!(
                "{} units have no activity for temporalization: {}",
                unresolved.len(),
                listing.join(", ")
            );
        }

        let mut factors: Vec<TemporalFactor> = profiles
            .iter()
            .filter(|p| selection.get(&p.key.unit).map_or(false, |poll| *poll == p.key.poll))
            .map(|p| {
                let anntot = annual_totals[&p.key];
                TemporalFactor {
                    unit: p.key.unit.clone(),
                    month: p.month(),
                    date: p.date,
                    dayfrac: p.daytot / anntot,
                    hourfrac: p.hrval.map(|v| v / anntot),
                    daytot: p.daytot,
                    hrval: p.hrval,
                }
            })
            .collect();
        factors.sort_by(|a, b| (&a.unit, a.date).cmp(&(&b.unit, b.date)));

        info!(
            "Temporal factors for {} units from {} day rows",
            selection.len(),
            factors.len()
        );
        TemporalProfile {
            factors,
            selection,
            unresolved,
        }
    }

    /// Spread annual values over the days and hours of the unit's activity.
    pub fn apply(&self, emissions: &[AnnualEmissionRecord], factors: &[TemporalFactor]) -> Allocation {
        let mut by_unit: HashMap<&UnitId, Vec<&TemporalFactor>> = HashMap::new();
        for f in factors {
            by_unit.entry(&f.unit).or_default().push(f);
        }

        let mut unmatched: BTreeSet<UnitId> = BTreeSet::new();
        let mut profiles = Vec::new();
        for e in emissions {
            let Some(unit_factors) = by_unit.get(&e.source.unit) else {
                unmatched.insert(e.source.unit.clone());
                continue;
            };
            for f in unit_factors {
                profiles.push(DailyProfile {
                    key: SourceKey::new(e.source.clone(), e.poll.as_str()),
                    date: f.date,
                    daytot: f.dayfrac * e.ann_value,
                    hrval: f.hourfrac.map(|v| v * e.ann_value),
                });
            }
        }

        info!("Missing unit matches: {}", unmatched.len());
        Allocation {
            profiles,
            unmatched: unmatched.into_iter().collect(),
        }
    }

    /// The unit activity itself as a pollutant row per source, split evenly
    /// across the unit's sources.
    pub fn activity_profiles(
        &self,
        factors: &[TemporalFactor],
        sources: &BTreeMap<UnitId, Vec<SourceId>>,
    ) -> Vec<DailyProfile<SourceKey>> {
        let mut profiles = Vec::new();
        for f in factors {
            let Some(unit_sources) = sources.get(&f.unit) else {
                continue;
            };
            let share = 1.0 / unit_sources.len() as f64;
            for source in unit_sources {
                let mut hrval = [0.0; HOURS];
                for (out, v) in hrval.iter_mut().zip(f.hrval.iter()) {
                    *out = v * share;
                }
                profiles.push(DailyProfile {
                    key: SourceKey::new(source.clone(), self.activity_label.as_str()),
                    date: f.date,
                    daytot: f.daytot * share,
                    hrval,
                });
            }
        }
        profiles
    }
}

impl Default for TemporalAllocator {
    fn default() -> Self {
        Self::new(DEFAULT_ACTIVITY_LABEL)
    }
}
