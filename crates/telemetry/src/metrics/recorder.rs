use std::time::Instant;

use opentelemetry::{Key, KeyValue, Value, metrics::Histogram};

/// A timer that records elapsed milliseconds to a histogram.
///
/// Timing starts when the recorder is created. Attributes can be added while the
/// operation runs, typically once its outcome is known:
///
/// ```rust,no_run
/// use telemetry::metrics::{Recorder, RATELIMIT_STORE_SCRIPT_DURATION};
///
/// let mut recorder = Recorder::new(RATELIMIT_STORE_SCRIPT_DURATION);
/// recorder.push_attribute("script", "fixed_window_limit");
/// recorder.push_attribute("status", "success");
/// recorder.record();
/// ```
pub struct Recorder {
    start: Instant,
    histogram: Histogram<f64>,
    attributes: Vec<KeyValue>,
}

impl Recorder {
    /// Creates a new recorder for the specified histogram.
    pub fn new(name: &'static str) -> Self {
        Self {
            start: Instant::now(),
            histogram: super::meter().f64_histogram(name).with_unit("ms").build(),
            attributes: Vec::new(),
        }
    }

    /// Adds an attribute to be recorded with the metric.
    pub fn push_attribute<K, V>(&mut self, key: K, value: V)
    where
        K: Into<Key>,
        V: Into<Value>,
    {
        self.attributes.push(KeyValue::new(key, value));
    }

    /// Records the elapsed time to the histogram.
    pub fn record(self) {
        let duration = self.start.elapsed().as_secs_f64() * 1000.0;
        self.histogram.record(duration, &self.attributes);
    }
}
