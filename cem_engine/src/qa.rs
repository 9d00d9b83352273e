use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};

use crate::calendar::round_to;
use crate::models::{DailyProfile, InventoryRecord, SeriesKey, SourceKey, UnitId};

/// Annual inventory before/after comparison row.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AnnualQaRow {
    pub facility_id: String,
    pub unit_id: String,
    pub oris_facility_code: String,
    pub oris_boiler_id: String,
    pub poll: String,
    pub ann_value_in: Option<f64>,
    pub ann_value_out: Option<f64>,
    pub monthsum: Option<f64>,
    pub diff: f64,
    pub absolute_pctdiff: Option<f64>,
}

/// Unit month comparison of monitored mass against the hourly output.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MonthlyQaRow {
    pub oris_facility_code: String,
    pub oris_boiler_id: String,
    pub month: u32,
    pub poll: String,
    pub ann_value_in: Option<f64>,
    pub ann_value_out: Option<f64>,
    pub diff: f64,
    pub pd: Option<f64>,
}

type AnnualKey = (String, String, String, String, String);

fn annual_key(r: &InventoryRecord) -> AnnualKey {
    let (facility, boiler) = r
        .oris
        .as_ref()
        .map(|u| (u.facility.clone(), u.boiler.clone()))
        .unwrap_or_default();
    (r.facility_id.clone(), r.unit_id.clone(), facility, boiler, r.poll.clone())
}

fn pct_of(diff: f64, base: Option<f64>) -> Option<f64> {
    base.filter(|b| *b != 0.0).map(|b| (diff / b).abs() * 100.0)
}

/// Outer join of input and output annual values per (facility, unit, ORIS unit, poll).
/// The activity pollutant is left out.
pub fn annual_qa(input: &[InventoryRecord], output: &[InventoryRecord], temporal_var: &str) -> Vec<AnnualQaRow> {
    let mut sums_in: BTreeMap<AnnualKey, f64> = BTreeMap::new();
    for r in input {
        *sums_in.entry(annual_key(r)).or_insert(0.0) += r.ann_value.unwrap_or(0.0);
    }
    let mut sums_out: BTreeMap<AnnualKey, (f64, f64)> = BTreeMap::new();
    for r in output {
        let monthsum = round_to(r.monthly.iter().map(|v| v.unwrap_or(0.0)).sum::<f64>(), 6);
        let entry = sums_out.entry(annual_key(r)).or_insert((0.0, 0.0));
        entry.0 += r.ann_value.unwrap_or(0.0);
        entry.1 += monthsum;
    }

    let keys: BTreeSet<&AnnualKey> = sums_in.keys().chain(sums_out.keys()).collect();
    keys.into_iter()
        .filter(|k| k.4 != temporal_var)
        .map(|k| {
            let ann_in = sums_in.get(k).copied();
            let out = sums_out.get(k).copied();
            let diff = round_to(out.map_or(0.0, |o| o.0) - ann_in.unwrap_or(0.0), 4);
            AnnualQaRow {
                facility_id: k.0.clone(),
                unit_id: k.1.clone(),
                oris_facility_code: k.2.clone(),
                oris_boiler_id: k.3.clone(),
                poll: k.4.clone(),
                ann_value_in: ann_in.map(|v| round_to(v, 6)),
                ann_value_out: out.map(|o| round_to(o.0, 6)),
                monthsum: out.map(|o| o.1),
                diff,
                absolute_pctdiff: pct_of(diff, ann_in).map(|p| round_to(p, 2)),
            }
        })
        .collect()
}

/// Unit month differences between monitored day rows and the hourly output for
/// `polls`. Only rows with a nonzero difference above 0.01 percent are kept.
pub fn monthly_qa(
    cem: &[DailyProfile<SeriesKey>],
    output: &[DailyProfile<SourceKey>],
    polls: &[String],
) -> Vec<MonthlyQaRow> {
    let wanted = |poll: &str| polls.iter().any(|p| p == poll);

    let mut sums_in: BTreeMap<(UnitId, u32, String), f64> = BTreeMap::new();
    for p in cem.iter().filter(|p| wanted(&p.key.poll)) {
        *sums_in
            .entry((p.key.unit.clone(), p.month(), p.key.poll.clone()))
            .or_insert(0.0) += p.daytot;
    }
    let mut sums_out: BTreeMap<(UnitId, u32, String), f64> = BTreeMap::new();
    for p in output.iter().filter(|p| wanted(&p.key.poll)) {
        *sums_out
            .entry((p.key.source.unit.clone(), p.month(), p.key.poll.clone()))
            .or_insert(0.0) += p.daytot;
    }

    let keys: BTreeSet<&(UnitId, u32, String)> = sums_in.keys().chain(sums_out.keys()).collect();
    keys.into_iter()
        .filter_map(|k| {
            let ann_in = sums_in.get(k).copied();
            let ann_out = sums_out.get(k).copied();
            let diff = round_to(ann_out.unwrap_or(0.0) - ann_in.unwrap_or(0.0), 6);
            let pd = pct_of(diff, ann_in);
            let significant = diff != 0.0 && pd.map_or(true, |p| p > 0.01);
            significant.then(|| MonthlyQaRow {
                oris_facility_code: k.0.facility.clone(),
                oris_boiler_id: k.0.boiler.clone(),
                month: k.1,
                poll: k.2.clone(),
                ann_value_in: ann_in,
                ann_value_out: ann_out,
                diff,
                pd,
            })
        })
        .collect()
}
