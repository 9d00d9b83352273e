use chrono::{Datelike, Duration};
use log::{debug, warn};
use std::collections::{BTreeSet, HashMap};

use crate::calendar::{days_in_year, regroup};
use crate::error::Result;
use crate::models::{DailyProfile, HourlyReading, ProfileKey, UnitId};

/// Shift readings from local standard time to GMT using each unit's fixed
/// offset (hours east of GMT, so -5 for Eastern).
///
/// Units with no offset are returned unshifted and listed.
pub fn shift_to_gmt(
    mut readings: Vec<HourlyReading>,
    offsets: &HashMap<UnitId, i32>,
) -> (Vec<HourlyReading>, Vec<UnitId>) {
    let mut unshifted = BTreeSet::new();
    for r in readings.iter_mut() {
        match offsets.get(&r.unit) {
            Some(offset) => r.timestamp -= Duration::hours(*offset as i64),
            None => {
                unshifted.insert(r.unit.clone());
            }
        }
    }

    if !unshifted.is_empty() {
        warn!("{} units have no timezone offset and were left in local time", unshifted.len());
    }
    (readings, unshifted.into_iter().collect())
}

/// Fold day rows that a shift pushed into `year + 1` back into `year`.
pub fn fill_ramp_up<K: ProfileKey>(mut profiles: Vec<DailyProfile<K>>, year: i32) -> Result<Vec<DailyProfile<K>>> {
    let span = Duration::days(days_in_year(year)? as i64);
    let mut moved = 0usize;
    for p in profiles.iter_mut().filter(|p| p.date.year() == year + 1) {
        p.date -= span;
        moved += 1;
    }
    debug!("Ramp up moved {} day rows back into {}", moved, year);
    Ok(regroup(profiles))
}
