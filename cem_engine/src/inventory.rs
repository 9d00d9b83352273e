use log::debug;
use std::collections::{BTreeMap, BTreeSet, HashMap};

use crate::calendar::{days_in_month, days_in_year, round_to};
use crate::error::Result;
use crate::models::{
    AnnualEmissionRecord, DailyProfile, InventoryRecord, MonthlyTotal, SeriesKey, SourceId, SourceKey, UnitId,
};

fn wanted(poll: &str, polls: Option<&[String]>) -> bool {
    polls.map_or(true, |ps| ps.iter().any(|p| p.eq_ignore_ascii_case(poll)))
}

/// Annual values for records tied to a monitored unit, with each record's
/// share of its unit's total for the pollutant.
///
/// When a unit's total is zero the share is split evenly across its records.
pub fn annual_emissions(records: &[InventoryRecord], polls: Option<&[String]>) -> Vec<AnnualEmissionRecord> {
    let tied: Vec<(SourceId, &InventoryRecord)> = records
        .iter()
        .filter(|r| wanted(&r.poll, polls))
        .filter_map(|r| r.source().map(|s| (s, r)))
        .collect();

    let mut unit_totals: HashMap<(&UnitId, &str), (f64, usize)> = HashMap::new();
    for (source, r) in &tied {
        let entry = unit_totals.entry((&source.unit, r.poll.as_str())).or_insert((0.0, 0));
        entry.0 += r.ann_value.unwrap_or(0.0);
        entry.1 += 1;
    }

    let emissions: Vec<AnnualEmissionRecord> = tied
        .iter()
        .map(|(source, r)| {
            let (total, count) = unit_totals[&(&source.unit, r.poll.as_str())];
            let ann_value = r.ann_value.unwrap_or(0.0);
            let unit_frac = if total > 0.0 { ann_value / total } else { 1.0 / count as f64 };
            AnnualEmissionRecord {
                source: source.clone(),
                poll: r.poll.clone(),
                ann_value,
                monthly: r.has_monthly().then(|| r.monthly.map(|v| v.unwrap_or(0.0))),
                unit_frac,
            }
        })
        .collect();

    let skipped = records.iter().filter(|r| wanted(&r.poll, polls)).count() - emissions.len();
    if skipped > 0 {
        debug!("Skipped {} inventory records without ORIS ids", skipped);
    }
    emissions
}

/// Authoritative monthly totals from inventory records.
///
/// Records with monthly values keep them (blank months are left out);
/// the rest spread the annual value by days in month.
pub fn monthly_totals(
    records: &[InventoryRecord],
    year: i32,
    months: &BTreeSet<u32>,
    polls: Option<&[String]>,
) -> Result<Vec<MonthlyTotal>> {
    let year_days = days_in_year(year)? as f64;
    let mut flat = [0.0; 12];
    for (idx, frac) in flat.iter_mut().enumerate() {
        *frac = days_in_month(year, idx as u32 + 1)? as f64 / year_days;
    }

    let mut totals: BTreeMap<(SourceId, String, u32), f64> = BTreeMap::new();
    for r in records.iter().filter(|r| wanted(&r.poll, polls)) {
        let Some(source) = r.source() else {
            continue;
        };
        let values: [Option<f64>; 12] = if r.has_monthly() {
            r.monthly
        } else {
            let ann = r.ann_value.unwrap_or(0.0);
            flat.map(|frac| Some(ann * frac))
        };
        for (idx, value) in values.iter().enumerate() {
            let month = idx as u32 + 1;
            if let (Some(v), true) = (value, months.contains(&month)) {
                *totals.entry((source.clone(), r.poll.clone(), month)).or_insert(0.0) += v;
            }
        }
    }

    Ok(totals
        .into_iter()
        .map(|((source, poll, month), total)| MonthlyTotal {
            source,
            poll,
            month,
            total,
        })
        .collect())
}

/// Monthly totals that replace inventory values with the unit's monitored
/// totals, split by each record's `unit_frac`.
pub fn replacement_totals(
    profiles: &[DailyProfile<SeriesKey>],
    emissions: &[AnnualEmissionRecord],
) -> Vec<MonthlyTotal> {
    let mut unit_months: BTreeMap<(&UnitId, &str), BTreeMap<u32, f64>> = BTreeMap::new();
    for p in profiles {
        *unit_months
            .entry((&p.key.unit, p.key.poll.as_str()))
            .or_default()
            .entry(p.month())
            .or_insert(0.0) += p.daytot;
    }

    let mut totals = Vec::new();
    for e in emissions {
        let Some(months) = unit_months.get(&(&e.source.unit, e.poll.as_str())) else {
            continue;
        };
        for (&month, &total) in months {
            totals.push(MonthlyTotal {
                source: e.source.clone(),
                poll: e.poll.clone(),
                month,
                total: total * e.unit_frac,
            });
        }
    }
    totals
}

/// Annual and monthly values per (source, poll) summed from day rows.
#[derive(Debug, Clone, PartialEq)]
pub struct AnnualSummary {
    pub source: SourceId,
    pub poll: String,
    pub ann_value: f64,
    pub monthly: [f64; 12],
}

pub fn summarize_annual(profiles: &[DailyProfile<SourceKey>]) -> Vec<AnnualSummary> {
    let mut sums: BTreeMap<(&SourceId, &str), [f64; 12]> = BTreeMap::new();
    for p in profiles {
        let months = sums.entry((&p.key.source, p.key.poll.as_str())).or_insert([0.0; 12]);
        months[p.month() as usize - 1] += p.daytot;
    }

    sums.into_iter()
        .map(|((source, poll), monthly)| {
            let monthly = monthly.map(|v| round_to(v, 8));
            AnnualSummary {
                source: source.clone(),
                poll: poll.to_string(),
                ann_value: round_to(monthly.iter().sum::<f64>(), 8),
                monthly,
            }
        })
        .collect()
}

/// Inventory records with summarised values swapped in.
///
/// Matching records take the summary values, records for other sources or
/// pollutants are kept, and summaries without a record are appended.
pub fn update_inventory(records: &[InventoryRecord], summaries: &[AnnualSummary]) -> Vec<InventoryRecord> {
    let mut by_key: BTreeMap<(SourceId, String), &AnnualSummary> = summaries
        .iter()
        .map(|s| ((s.source.clone(), s.poll.clone()), s))
        .collect();

    let mut updated: Vec<InventoryRecord> = Vec::with_capacity(records.len() + by_key.len());
    for r in records {
        let mut record = r.clone();
        if let Some(source) = r.source() {
            if let Some(summary) = by_key.remove(&(source, r.poll.clone())) {
                record.ann_value = Some(summary.ann_value);
                record.monthly = summary.monthly.map(Some);
            }
        }
        updated.push(record);
    }

    if !by_key.is_empty() {
        debug!("Appending {} inventory records without an annual counterpart", by_key.len());
    }
    for ((source, poll), summary) in by_key {
        updated.push(InventoryRecord {
            facility_id: source.facility_id.clone(),
            unit_id: source.unit_id.clone(),
            rel_point_id: source.rel_point_id.clone(),
            process_id: source.process_id.clone(),
            oris: Some(source.unit.clone()),
            poll,
            ann_value: Some(summary.ann_value),
            monthly: summary.monthly.map(Some),
        });
    }
    updated
}

/// Distinct sources per unit, in order.
pub fn sources_by_unit(emissions: &[AnnualEmissionRecord]) -> BTreeMap<UnitId, Vec<SourceId>> {
    let mut sources: BTreeMap<UnitId, BTreeSet<SourceId>> = BTreeMap::new();
    for e in emissions {
        sources.entry(e.source.unit.clone()).or_default().insert(e.source.clone());
    }
    sources
        .into_iter()
        .map(|(unit, set)| (unit, set.into_iter().collect()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::HOURS;
    use chrono::NaiveDate;

    fn record(process: &str, poll: &str, ann: Option<f64>) -> InventoryRecord {
        InventoryRecord {
            facility_id: "F1".to_string(),
            unit_id: "U1".to_string(),
            rel_point_id: "R1".to_string(),
            process_id: process.to_string(),
            oris: Some(UnitId::new("3", "1")),
            poll: poll.to_string(),
            ann_value: ann,
            monthly: [None; 12],
        }
    }

    #[test]
    fn test_unit_frac_apportions_unit_total() {
        let mut records = vec![record("P1", "PM25-PRI", Some(30.0)), record("P2", "PM25-PRI", Some(10.0))];
        let mut orphan = record("P3", "PM25-PRI", Some(99.0));
        orphan.oris = None;
        records.push(orphan);

        let emis = annual_emissions(&records, None);
        assert_eq!(emis.len(), 2);
        assert!((emis[0].unit_frac - 0.75).abs() < 1e-12);
        assert!((emis[1].unit_frac - 0.25).abs() < 1e-12);
    }

    #[test]
    fn test_zero_unit_total_splits_evenly() {
        let records = vec![record("P1", "NOX", Some(0.0)), record("P2", "NOX", None)];
        let emis = annual_emissions(&records, Some(&["NOX".to_string()]));
        assert!(emis.iter().all(|e| (e.unit_frac - 0.5).abs() < 1e-12));
    }

    #[test]
    fn test_flat_monthly_profile_for_annual_only_records() {
        let records = vec![record("P1", "NOX", Some(366.0))];
        let months: BTreeSet<u32> = (1..=12).collect();
        let totals = monthly_totals(&records, 2016, &months, None).unwrap();
        assert_eq!(totals.len(), 12);
        let feb = totals.iter().find(|t| t.month == 2).unwrap();
        assert!((feb.total - 29.0).abs() < 1e-9);
        let sum: f64 = totals.iter().map(|t| t.total).sum();
        assert!((sum - 366.0).abs() < 1e-9);
    }

    #[test]
    fn test_reported_monthly_values_are_kept() {
        let mut r = record("P1", "NOX", Some(100.0));
        r.monthly[0] = Some(60.0);
        r.monthly[1] = Some(40.0);
        let months: BTreeSet<u32> = [1, 2, 3].into_iter().collect();
        let totals = monthly_totals(&[r], 2016, &months, None).unwrap();
        assert_eq!(totals.len(), 2);
        assert_eq!(totals[0].total, 60.0);
        assert_eq!(totals[1].total, 40.0);
    }

    #[test]
    fn test_replacement_totals_follow_unit_frac() {
        let records = vec![record("P1", "NOX", Some(30.0)), record("P2", "NOX", Some(10.0))];
        let emis = annual_emissions(&records, None);
        let date = NaiveDate::from_ymd_opt(2016, 1, 5).unwrap();
        let profiles = vec![DailyProfile::from_hours(
            SeriesKey::new(UnitId::new("3", "1"), "NOX"),
            date,
            [1.0; HOURS],
        )];

        let totals = replacement_totals(&profiles, &emis);
        assert_eq!(totals.len(), 2);
        assert!((totals[0].total - 18.0).abs() < 1e-12);
        assert!((totals[1].total - 6.0).abs() < 1e-12);
    }

    #[test]
    fn test_update_inventory_replaces_and_appends() {
        let records = vec![record("P1", "NOX", Some(30.0)), record("P1", "SO2", Some(5.0))];
        let source = records[0].source().unwrap();
        let date = NaiveDate::from_ymd_opt(2016, 3, 1).unwrap();
        let profiles = vec![
            DailyProfile::from_hours(SourceKey::new(source.clone(), "NOX"), date, [0.5; HOURS]),
            DailyProfile::from_hours(SourceKey::new(source, "HOURACT"), date, [2.0; HOURS]),
        ];

        let summaries = summarize_annual(&profiles);
        let updated = update_inventory(&records, &summaries);
        assert_eq!(updated.len(), 3);
        assert_eq!(updated[0].ann_value, Some(12.0));
        assert_eq!(updated[0].monthly[2], Some(12.0));
        assert_eq!(updated[1].ann_value, Some(5.0));
        assert_eq!(updated[2].poll, "HOURACT");
        assert_eq!(updated[2].ann_value, Some(48.0));
    }
}
