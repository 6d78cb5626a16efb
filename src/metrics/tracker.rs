use std::time::Instant;

use prometheus::Histogram;

/// Observes the time between its creation and drop, in microseconds.
pub struct Tracker {
    pub start: Instant,
    hist: Histogram,
}

impl std::fmt::Debug for Tracker {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> Result<(), std::fmt::Error> {
        write!(f, "Tracker<start={:?}>", self.start)
    }
}

impl Tracker {
    pub fn new(hist: Histogram) -> Tracker {
        Self {
            start: Instant::now(),
            hist,
        }
    }
}

impl Drop for Tracker {
    fn drop(&mut self) {
        let dur = self.start.elapsed();
        self.hist.observe(dur.as_secs_f64() * 1_000_000.0);
    }
}
