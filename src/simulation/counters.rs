use std::{
    collections::HashMap,
    fmt::Write,
    time::{Duration, Instant},
};

use crate::floating_type_mod::FT;

/// One recorded value per fixed step (or per event for "fracture").
#[derive(Clone)]
pub struct Counter<T> {
    values: Vec<T>,
    last_start: Instant,
}
impl<T> Counter<T> {
    fn new() -> Self {
        Counter::<T> {
            last_start: Instant::now(),
            values: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}
impl Counter<FT> {
    pub fn sum(&self) -> FT {
        self.values.iter().cloned().sum::<FT>()
    }
    pub fn avg(&self) -> FT {
        self.sum() / self.values.len() as FT
    }
    pub fn min(&self) -> FT {
        self.values.iter().cloned().fold(FT::INFINITY, FT::min)
    }
    pub fn max(&self) -> FT {
        self.values.iter().cloned().fold(FT::NEG_INFINITY, FT::max)
    }
}
impl Counter<Duration> {
    fn begin(&mut self) {
        self.last_start = Instant::now();
    }

    fn end(&mut self) {
        self.values.push(self.last_start.elapsed());
    }

    // a pass that runs once per substep sums into the value of its step
    fn end_add_to_last(&mut self) {
        let duration = self.last_start.elapsed();
        match self.values.last_mut() {
            Some(last) => *last += duration,
            None => self.values.push(duration),
        }
    }

    pub fn sum(&self) -> Duration {
        self.values.iter().cloned().sum::<Duration>()
    }

    pub fn avg(&self) -> Duration {
        if self.values.is_empty() {
            return Duration::ZERO;
        }
        self.sum() / self.values.len() as u32
    }

    pub fn max(&self) -> Duration {
        self.values.iter().cloned().max().unwrap_or(Duration::ZERO)
    }
}

pub struct ValueCounters {
    pub counters: HashMap<String, Counter<FT>>,
    enabled: bool,
}
impl ValueCounters {
    pub fn new(enabled: bool) -> ValueCounters {
        ValueCounters {
            counters: HashMap::default(),
            enabled,
        }
    }

    pub fn add_value(&mut self, id: &str, v: FT) {
        if self.enabled {
            self.counters
                .entry(id.to_string())
                .or_insert_with(Counter::<FT>::new)
                .values
                .push(v);
        }
    }
}

/// Wall-clock timings of the solver passes. Disabled counters record nothing.
pub struct PerformanceCounters {
    pub counters: HashMap<String, Counter<Duration>>,
    enabled: bool,
}
impl PerformanceCounters {
    pub fn new(enabled: bool) -> PerformanceCounters {
        PerformanceCounters {
            counters: HashMap::default(),
            enabled,
        }
    }

    pub fn begin(&mut self, id: &str) {
        if self.enabled {
            self.counters
                .entry(id.to_string())
                .or_insert_with(Counter::<Duration>::new)
                .begin();
        }
    }

    /// Records the time since `begin` as a new value.
    pub fn end(&mut self, id: &str) {
        if let Some(counter) = self.enabled_counter(id) {
            counter.end();
        }
    }

    /// Adds the time since `begin` to the last value.
    pub fn end_add_to_last(&mut self, id: &str) {
        if let Some(counter) = self.enabled_counter(id) {
            counter.end_add_to_last();
        }
    }

    fn enabled_counter(&mut self, id: &str) -> Option<&mut Counter<Duration>> {
        if self.enabled {
            self.counters.get_mut(id)
        } else {
            None
        }
    }
}

/**
 * Renders both counter sets sorted by label: total simulated wall time, then
 * per-pass average and maximum per step, then the value statistics.
 */
pub fn write_statistics(pcounters: &PerformanceCounters, vcounters: &ValueCounters) -> String {
    let mut s = String::new();

    if let Some(step) = pcounters.counters.get("simulation-step") {
        let _ = writeln!(
            s,
            "simulation-time: {}ms ({} steps)",
            step.sum().as_secs_f64() * 1000.,
            step.len()
        );
        let _ = writeln!(s);
    }

    let mut v = pcounters.counters.iter().collect::<Vec<_>>();
    v.sort_by(|x, y| x.0.cmp(y.0));
    for (label, pcounter) in v {
        let _ = writeln!(
            s,
            "{}: avg:{}ms max:{}ms n:{}",
            label,
            pcounter.avg().as_secs_f64() * 1000.,
            pcounter.max().as_secs_f64() * 1000.,
            pcounter.len()
        );
    }
    let _ = writeln!(s);

    let mut v = vcounters.counters.iter().collect::<Vec<_>>();
    v.sort_by(|x, y| x.0.cmp(y.0));
    for (label, vcounter) in v {
        let _ = writeln!(
            s,
            "{}: min:{} max:{} avg:{}",
            label,
            vcounter.min(),
            vcounter.max(),
            vcounter.avg()
        );
    }

    s
}

#[test]
fn counters_only_record_when_enabled() {
    let mut disabled = ValueCounters::new(false);
    disabled.add_value("particle-count", 3.);
    assert!(disabled.counters.is_empty());

    let mut disabled = PerformanceCounters::new(false);
    disabled.begin("density");
    disabled.end("density");
    assert!(disabled.counters.is_empty());

    let mut vcounters = ValueCounters::new(true);
    vcounters.add_value("substeps", 2.);
    vcounters.add_value("substeps", 4.);
    let c = &vcounters.counters["substeps"];
    assert_eq!(c.min(), 2.);
    assert_eq!(c.max(), 4.);
    assert_eq!(c.avg(), 3.);
    assert_eq!(c.sum(), 6.);

    let mut pcounters = PerformanceCounters::new(true);
    for _ in 0..3 {
        pcounters.begin("density");
        pcounters.end("density");
        pcounters.begin("density");
        pcounters.end_add_to_last("density");
    }
    assert_eq!(pcounters.counters["density"].len(), 3);

    let s = write_statistics(&pcounters, &vcounters);
    assert!(s.contains("density: avg:"));
    assert!(s.contains("n:3"));
    assert!(s.contains("substeps: min:2 max:4 avg:3"));
}
