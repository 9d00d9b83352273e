use chrono::{Datelike, NaiveDate};
use log::{debug, warn};
use std::collections::{BTreeMap, BTreeSet, HashSet};

use crate::error::{EngineError, Result};
use crate::models::{CalendarEntry, Channel, DailyProfile, HourlyReading, ProfileKey, SeriesKey, HOURS};

pub fn days_in_month(year: i32, month: u32) -> Result<u32> {
    if !(1..=12).contains(&month) {
        return Err(EngineError::InvalidMonth(month));
    }
    let first = NaiveDate::from_ymd_opt(year, month, 1).ok_or(EngineError::InvalidYear(year))?;
    let next = if month == 12 {
        NaiveDate::from_ymd_opt(year + 1, 1, 1)
    } else {
        NaiveDate::from_ymd_opt(year, month + 1, 1)
    }
    .ok_or(EngineError::InvalidYear(year))?;
    Ok((next - first).num_days() as u32)
}

pub fn days_in_year(year: i32) -> Result<u32> {
    let first = NaiveDate::from_ymd_opt(year, 1, 1).ok_or(EngineError::InvalidYear(year))?;
    let next = NaiveDate::from_ymd_opt(year + 1, 1, 1).ok_or(EngineError::InvalidYear(year))?;
    Ok((next - first).num_days() as u32)
}

/// Every calendar day of `month` in `year`.
pub fn month_days(year: i32, month: u32) -> Result<Vec<NaiveDate>> {
    let days = days_in_month(year, month)?;
    (1..=days)
        .map(|d| NaiveDate::from_ymd_opt(year, month, d).ok_or(EngineError::InvalidYear(year)))
        .collect()
}

/// Length of the month containing `date`.
pub fn month_length(date: NaiveDate) -> u32 {
    let mut day = 28;
    while day < 31 && NaiveDate::from_ymd_opt(date.year(), date.month(), day + 1).is_some() {
        day += 1;
    }
    day
}

pub fn round_to(value: f64, places: i32) -> f64 {
    let factor = 10f64.powi(places);
    (value * factor).round() / factor
}

/// Reject the run if any (unit, timestamp) appears twice.
pub fn ensure_unique(readings: &[HourlyReading]) -> Result<()> {
    let mut seen = HashSet::with_capacity(readings.len());
    for r in readings {
        if !seen.insert((&r.unit, r.timestamp)) {
            return Err(EngineError::DuplicateReading {
                unit: r.unit.clone(),
                timestamp: r.timestamp,
            });
        }
    }
    Ok(())
}

/// Pivot hourly readings to one day row per (unit, channel, date).
///
/// NOX and SO2 go from lbs to tons. Hourly values and day totals are rounded
/// to 4 places and days with nothing positive are dropped.
pub fn pivot_hourly(readings: &[HourlyReading]) -> Vec<DailyProfile<SeriesKey>> {
    let mut days: BTreeMap<(SeriesKey, NaiveDate), [f64; HOURS]> = BTreeMap::new();

    for r in readings {
        let hour = r.hour() as usize;
        for channel in Channel::VALUE_CHANNELS {
            let value = channel.to_inventory_units(r.value(channel).unwrap_or(0.0));
            let slot = days
                .entry((SeriesKey::new(r.unit.clone(), channel.label()), r.date()))
                .or_insert([0.0; HOURS]);
            slot[hour] += value;
        }
    }

    days.into_iter()
        .filter_map(|((key, date), mut hrval)| {
            for v in hrval.iter_mut() {
                *v = round_to(*v, 4);
            }
            let mut profile = DailyProfile::from_hours(key, date, hrval);
            profile.daytot = round_to(profile.daytot, 4);
            (profile.daytot > 0.0).then_some(profile)
        })
        .collect()
}

/// Merge rows sharing a (key, date), summing their values. Output is sorted.
pub fn regroup<K: ProfileKey>(profiles: Vec<DailyProfile<K>>) -> Vec<DailyProfile<K>> {
    let mut merged: BTreeMap<(K, NaiveDate), DailyProfile<K>> = BTreeMap::new();
    for p in profiles {
        match merged.get_mut(&(p.key.clone(), p.date)) {
            Some(existing) => existing.accumulate(&p),
            None => {
                merged.insert((p.key.clone(), p.date), p);
            }
        }
    }
    merged.into_values().collect()
}

/// The expected (key, date) set: every key crossed with every day of the months.
pub fn expected_calendar<K: ProfileKey>(
    keys: &BTreeSet<K>,
    months: &BTreeSet<u32>,
    year: i32,
) -> Result<Vec<CalendarEntry<K>>> {
    let mut days = Vec::new();
    for &month in months {
        days.extend(month_days(year, month)?);
    }

    let mut entries = Vec::with_capacity(keys.len() * days.len());
    for key in keys {
        for &date in &days {
            entries.push(CalendarEntry {
                key: key.clone(),
                date,
            });
        }
    }
    Ok(entries)
}

/// Fill every (key, day) of the months present in `profiles` for `year`,
/// inserting zero rows for missing days.
pub fn gapfill_dates<K: ProfileKey>(profiles: Vec<DailyProfile<K>>, year: i32) -> Result<Vec<DailyProfile<K>>> {
    let months: BTreeSet<u32> = profiles.iter().map(|p| p.month()).collect();
    let keys: BTreeSet<K> = profiles.iter().map(|p| p.key.clone()).collect();

    let mut present: BTreeMap<(K, NaiveDate), DailyProfile<K>> = BTreeMap::new();
    let mut outside = 0usize;
    for p in profiles {
        if p.date.year() != year {
            outside += 1;
            continue;
        }
        match present.get_mut(&(p.key.clone(), p.date)) {
            Some(existing) => {
                debug!("Merging duplicate day row for {}", p.date);
                existing.accumulate(&p);
            }
            None => {
                present.insert((p.key.clone(), p.date), p);
            }
        }
    }
    if outside > 0 {
        warn!("Dropped {} day rows outside of {} while gap filling", outside, year);
    }

    let calendar = expected_calendar(&keys, &months, year)?;
    let before = present.len();
    let filled: Vec<DailyProfile<K>> = calendar
        .into_iter()
        .map(|entry| {
            present
                .remove(&(entry.key.clone(), entry.date))
                .unwrap_or_else(|| DailyProfile::zero(entry.key, entry.date))
        })
        .collect();
    debug!("Gap filled {} day rows to {}", before, filled.len());

    Ok(filled)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::UnitId;
    use chrono::NaiveDateTime;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn ts(y: i32, m: u32, d: u32, h: u32) -> NaiveDateTime {
        date(y, m, d).and_hms_opt(h, 0, 0).unwrap()
    }

    fn key(boiler: &str, poll: &str) -> SeriesKey {
        SeriesKey::new(UnitId::new("3", boiler), poll)
    }

    #[test]
    fn test_days_in_month_leap_years() {
        assert_eq!(days_in_month(2016, 2).unwrap(), 29);
        assert_eq!(days_in_month(2017, 2).unwrap(), 28);
        assert_eq!(days_in_month(2016, 12).unwrap(), 31);
        assert_eq!(days_in_year(2016).unwrap(), 366);
        assert!(days_in_month(2016, 13).is_err());
        assert_eq!(month_length(date(2016, 2, 10)), 29);
        assert_eq!(month_length(date(2016, 4, 30)), 30);
    }

    #[test]
    fn test_gapfill_is_exact_cross_product() {
        let mut hrval = [0.0; HOURS];
        hrval[10] = 5.0;
        let profiles = vec![
            DailyProfile::from_hours(key("1", "NOX"), date(2016, 2, 3), hrval),
            DailyProfile::from_hours(key("2", "SO2"), date(2016, 2, 20), hrval),
        ];

        let filled = gapfill_dates(profiles, 2016).unwrap();
        assert_eq!(filled.len(), 2 * 29);

        let unique: HashSet<_> = filled.iter().map(|p| (p.key.clone(), p.date)).collect();
        assert_eq!(unique.len(), filled.len());

        let kept = filled
            .iter()
            .find(|p| p.key == key("1", "NOX") && p.date == date(2016, 2, 3))
            .unwrap();
        assert_eq!(kept.daytot, 5.0);
        assert_eq!(kept.hrval[10], 5.0);

        let zeroed = filled
            .iter()
            .find(|p| p.key == key("1", "NOX") && p.date == date(2016, 2, 20))
            .unwrap();
        assert_eq!(zeroed.daytot, 0.0);
        assert!(zeroed.hrval.iter().all(|v| *v == 0.0));
    }

    #[test]
    fn test_gapfill_covers_every_month_present() {
        let hrval = [1.0; HOURS];
        let profiles = vec![
            DailyProfile::from_hours(key("1", "NOX"), date(2017, 1, 31), hrval),
            DailyProfile::from_hours(key("1", "NOX"), date(2017, 3, 1), hrval),
        ];
        let filled = gapfill_dates(profiles, 2017).unwrap();
        assert_eq!(filled.len(), 31 + 31);
        assert!(filled.iter().all(|p| p.month() != 2));
    }

    #[test]
    fn test_ensure_unique_rejects_duplicates() {
        let unit = UnitId::new("3", "1");
        let readings = vec![
            HourlyReading::new(unit.clone(), ts(2016, 1, 1, 0)),
            HourlyReading::new(unit.clone(), ts(2016, 1, 1, 1)),
            HourlyReading::new(unit, ts(2016, 1, 1, 0)),
        ];
        match ensure_unique(&readings) {
            Err(EngineError::DuplicateReading { timestamp, .. }) => assert_eq!(timestamp, ts(2016, 1, 1, 0)),
            other => panic!("expected duplicate error, got {:?}", other),
        }
    }

    #[test]
    fn test_pivot_converts_lbs_and_drops_empty_days() {
        let unit = UnitId::new("3", "1");
        let readings = vec![
            HourlyReading::new(unit.clone(), ts(2016, 1, 1, 5))
                .with_value(Channel::Nox, 4000.0)
                .with_value(Channel::HeatInput, 120.0),
            HourlyReading::new(unit.clone(), ts(2016, 1, 1, 6)).with_value(Channel::Nox, 1000.0),
            HourlyReading::new(unit, ts(2016, 1, 2, 0)).with_value(Channel::Nox, 0.0),
        ];

        let profiles = pivot_hourly(&readings);
        let nox: Vec<_> = profiles.iter().filter(|p| p.key.poll == "NOX").collect();
        assert_eq!(nox.len(), 1);
        assert_eq!(nox[0].hrval[5], 2.0);
        assert_eq!(nox[0].hrval[6], 0.5);
        assert_eq!(nox[0].daytot, 2.5);

        let heat: Vec<_> = profiles.iter().filter(|p| p.key.poll == "HTINPUT").collect();
        assert_eq!(heat.len(), 1);
        assert_eq!(heat[0].daytot, 120.0);
        assert!(profiles.iter().all(|p| p.key.poll != "SO2"));
    }

    #[test]
    fn test_regroup_sums_shared_days() {
        let hrval = [1.0; HOURS];
        let profiles = vec![
            DailyProfile::from_hours(key("1", "NOX"), date(2016, 1, 1), hrval),
            DailyProfile::from_hours(key("1", "NOX"), date(2016, 1, 1), hrval),
        ];
        let merged = regroup(profiles);
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].daytot, 48.0);
        assert_eq!(merged[0].hrval[0], 2.0);
    }
}
