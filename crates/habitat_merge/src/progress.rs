use log::info;
use std::time::{Duration, Instant};

/// Throttled progress lines for one worker.
#[derive(Debug)]
pub struct Tick<'a> {
    label: &'a str,
    noun: &'static str,
    total: usize,
    every: usize,
    start: Instant,
    last: Instant,
}

impl<'a> Tick<'a> {
    const MIN_INTERVAL: Duration = Duration::from_millis(200);

    /// Log at most once per `every` items and never faster than every 200 ms.
    pub fn new(label: &'a str, noun: &'static str, total: usize, every: usize) -> Self {
        let now = Instant::now();
        Self {
            label,
            noun,
            total,
            every: every.max(1),
            start: now,
            last: now,
        }
    }

    /// Report that `done` items are finished.
    pub fn step(&mut self, done: usize) {
        if done % self.every != 0 || self.last.elapsed() < Self::MIN_INTERVAL {
            return;
        }
        info!(
            "{}: {:>9} / {} {}, {:8.1}/s",
            self.label,
            done,
            self.total,
            self.noun,
            self.rate(done)
        );
        self.last = Instant::now();
    }

    /// Items per second since the tick was created.
    pub fn rate(&self, done: usize) -> f64 {
        done as f64 / self.start.elapsed().as_secs_f64().max(1e-9)
    }
}
