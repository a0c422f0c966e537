//! Stress driver: one producer, one background spiller and one consumer
//! hammering a single container, checking that every value comes out exactly
//! once and in order.

use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use log::{debug, info};

use crate::codec::{Datum, Tuple, TupleCodec};
use crate::conf::Config;
use crate::container::{Spillable, SpillableBag, SpillableColumn};
use crate::core::SpillError;

#[derive(Debug, Clone, PartialEq)]
pub struct StressReport {
    pub target: &'static str,
    pub records: u64,
    pub spills: u64,
    pub spilled: u64,
    pub peak_memory: u64,
    pub elapsed: Duration,
}

#[derive(Debug, Default)]
struct SpillStats {
    spills: u64,
    spilled: u64,
    peak_memory: u64,
}

/// Record `i` of a stress run: a long key followed by `fields - 1` derived
/// values of mixed types.
pub fn stress_tuple(i: u64, fields: usize) -> Tuple {
    let mut tuple = Vec::with_capacity(fields.max(1));
    tuple.push(Datum::Long(i as i64));
    for f in 1..fields {
        tuple.push(match f % 4 {
            0 => Datum::Null,
            1 => Datum::Int((i % 1_000_000) as i32),
            2 => Datum::Double(i as f64 * 0.5),
            _ => Datum::CharArray(format!("value-{i}")),
        });
    }
    tuple
}

fn spill_loop(
    target: &dyn Spillable,
    interval: Duration,
    stop: &AtomicBool,
) -> Result<SpillStats, SpillError> {
    let mut stats = SpillStats::default();
    while !stop.load(Ordering::Acquire) {
        stats.peak_memory = stats.peak_memory.max(target.memory_size());
        let written = target.spill()?;
        if written > 0 {
            stats.spills += 1;
            stats.spilled += written;
        }
        thread::sleep(interval);
    }
    Ok(stats)
}

fn joined<T>(result: thread::Result<Result<T, SpillError>>, role: &str) -> Result<T, SpillError> {
    result.map_err(|_| SpillError::InvariantViolation(format!("{role} thread panicked")))?
}

/// Appends `0..records` to a column while a spiller runs and the main thread
/// drains it concurrently.
pub fn run_column(config: &Config) -> Result<StressReport, SpillError> {
    let records = config.stress.records;
    let column = SpillableColumn::<i64>::new(config.spill.clone())?;
    let produced = AtomicBool::new(false);
    let stop = AtomicBool::new(false);
    let started = Instant::now();

    let stats = thread::scope(|s| {
        let producer = s.spawn(|| {
            let result = (0..records as i64).try_for_each(|v| column.add(v));
            produced.store(true, Ordering::Release);
            result
        });
        let spiller = s.spawn(|| spill_loop(&column, config.stress.spill_interval, &stop));

        let consumed = drain_column(&column, records, &produced);
        stop.store(true, Ordering::Release);
        let production = joined(producer.join(), "producer");
        let stats = joined(spiller.join(), "spiller");
        production?;
        consumed?;
        stats
    })?;

    let report = StressReport {
        target: "column",
        records,
        spills: stats.spills,
        spilled: stats.spilled,
        peak_memory: stats.peak_memory,
        elapsed: started.elapsed(),
    };
    info!("Column stress run finished: {report:?}");
    Ok(report)
}

fn drain_column(
    column: &SpillableColumn<i64>,
    records: u64,
    produced: &AtomicBool,
) -> Result<(), SpillError> {
    let mut it = column.iterator();
    let mut expected = 0i64;
    loop {
        if it.has_next() {
            let value = it.next_value()?;
            if value != expected {
                return Err(SpillError::InvariantViolation(format!(
                    "column yielded {value}, expected {expected}"
                )));
            }
            expected += 1;
        } else if produced.load(Ordering::Acquire) && !it.has_next() {
            break;
        } else {
            thread::yield_now();
        }
    }
    if expected as u64 != records {
        return Err(SpillError::InvariantViolation(format!(
            "column yielded {expected} values, expected {records}"
        )));
    }
    Ok(())
}

/// Fills a bag while a spiller runs, then drains it. The spiller keeps going
/// during iteration unless `stress.spill_during_iteration` is off.
pub fn run_bag(config: &Config) -> Result<StressReport, SpillError> {
    let records = config.stress.records;
    let fields = config.stress.fields;
    let bag = SpillableBag::new(TupleCodec, config.spill.clone())?;
    let stop = AtomicBool::new(false);
    let started = Instant::now();

    let stats = thread::scope(|s| {
        let spiller = s.spawn(|| spill_loop(&bag, config.stress.spill_interval, &stop));
        let producer = s.spawn(|| {
            (0..records).try_for_each(|i| bag.add(stress_tuple(i, fields)))
        });

        let result = joined(producer.join(), "producer").and_then(|()| {
            if !config.stress.spill_during_iteration {
                stop.store(true, Ordering::Release);
            }
            debug!("Bag filled with {} records, draining", bag.size());
            drain_bag(&bag, records, fields)
        });
        stop.store(true, Ordering::Release);
        let stats = joined(spiller.join(), "spiller");
        result?;
        stats
    })?;

    let report = StressReport {
        target: "bag",
        records,
        spills: stats.spills,
        spilled: stats.spilled,
        peak_memory: stats.peak_memory,
        elapsed: started.elapsed(),
    };
    info!("Bag stress run finished: {report:?}");
    Ok(report)
}

fn drain_bag(
    bag: &SpillableBag<TupleCodec>,
    records: u64,
    fields: usize,
) -> Result<(), SpillError> {
    let mut expected = 0u64;
    for record in bag.iterator()? {
        let record = record?;
        let key = record.first().and_then(Datum::as_i64);
        if key != Some(expected as i64) || record.len() != fields.max(1) {
            return Err(SpillError::InvariantViolation(format!(
                "bag yielded {record:?}, expected key {expected}"
            )));
        }
        expected += 1;
    }
    if expected != records {
        return Err(SpillError::InvariantViolation(format!(
            "bag yielded {expected} records, expected {records}"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conf::SpillConfig;
    use tempfile::TempDir;

    fn config(dir: &TempDir, records: u64) -> Config {
        let mut config = Config::default();
        config.spill = SpillConfig::in_dir(dir.path()).with_slab_capacity(64);
        config.stress.records = records;
        config.stress.spill_interval = Duration::from_micros(50);
        config
    }

    #[test]
    fn test_stress_tuple_shape() {
        let t = stress_tuple(7, 5);
        assert_eq!(t.len(), 5);
        assert_eq!(t[0], Datum::Long(7));
        assert_eq!(t[4], Datum::Null);
        assert_eq!(stress_tuple(3, 0).len(), 1);
    }

    #[test]
    fn test_run_column() {
        let dir = TempDir::new().unwrap();
        let report = run_column(&config(&dir, 20_000)).unwrap();
        assert_eq!(report.records, 20_000);
        assert_eq!(report.target, "column");
    }

    #[test]
    fn test_run_bag() {
        let dir = TempDir::new().unwrap();
        let report = run_bag(&config(&dir, 5_000)).unwrap();
        assert_eq!(report.records, 5_000);
        assert!(report.spilled <= 5_000);
    }
}
