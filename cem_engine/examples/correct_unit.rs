use chrono::{Duration, NaiveDate};
use cem_engine::{correct_readings, Channel, CorrectionConfig, HourlyReading, QualityCode, QualityFlags, UnitId};

fn main() {
    env_logger::init();

    let unit = UnitId::new("3", "1");
    let start = NaiveDate::from_ymd_opt(2016, 1, 1)
        .unwrap()
        .and_hms_opt(12, 0, 0)
        .unwrap();

    // Three weeks of steady noon readings, then one substituted heat input spike
    let mut readings = vec![];
    for day in 0..21 {
        readings.push(
            HourlyReading::new(unit.clone(), start + Duration::days(day))
                .with_value(Channel::HeatInput, 100.0)
                .with_value(Channel::Nox, 20.0)
                .with_quality(QualityFlags::all(QualityCode::Measured)),
        );
    }
    readings.push(
        HourlyReading::new(unit.clone(), start + Duration::days(21))
            .with_value(Channel::HeatInput, 500.0)
            .with_value(Channel::Nox, 100.0)
            .with_quality(QualityFlags::all(QualityCode::Substitute)),
    );

    let outcome = correct_readings(readings, &CorrectionConfig::default());

    println!("CEM Correction Results");
    println!("======================");
    println!("Unit: {}", unit);
    println!("Means computed: {}", outcome.means.len());
    println!();
    for event in &outcome.qa {
        println!(
            "{} {}: {} (code {}) {:.1} -> {:.1}",
            event.timestamp,
            event.field,
            event.unit,
            event.measurement_code.code(),
            event.original_value,
            event.replacement_value
        );
    }
}
