//! Pipeline metrics
//!
//! Publishes logger and sink counters through the `metrics` facade and
//! aggregates successive snapshots into rates for run summaries.

use std::fmt;
use std::time::Instant;

use contracts::{Lifecycle, LoggerStats, SinkStats};
use metrics::{counter, gauge};

/// Publish a logger snapshot
///
/// Counters are set to the snapshot's absolute values, so calling this
/// repeatedly with fresh snapshots is idempotent.
pub fn record_logger_stats(stats: &LoggerStats) {
    counter!("reglog_records_submitted_total").absolute(stats.submitted);
    counter!("reglog_records_dispatched_total").absolute(stats.dispatched);
    counter!("reglog_records_dropped_total").absolute(stats.dropped);
    gauge!("reglog_queue_len").set(stats.queue_len as f64);
    gauge!("reglog_sinks").set(stats.sink_count as f64);

    let lifecycle = match stats.lifecycle {
        Lifecycle::Stopped => 0.0,
        Lifecycle::Running => 1.0,
        Lifecycle::Draining => 2.0,
    };
    gauge!("reglog_lifecycle").set(lifecycle);
}

/// Publish a sink snapshot, labelled by sink name
pub fn record_sink_stats(stats: &SinkStats) {
    let sink = stats.name.clone();
    gauge!("reglog_sink_queued", "sink" => sink.clone()).set(stats.queued as f64);
    counter!("reglog_sink_written_total", "sink" => sink.clone()).absolute(stats.written);
    counter!("reglog_sink_dropped_total", "sink" => sink.clone()).absolute(stats.dropped);
    counter!("reglog_sink_failures_total", "sink" => sink.clone()).absolute(stats.failures);
    counter!("reglog_sink_rotations_total", "sink" => sink).absolute(stats.rotations);
}

/// Aggregates periodic snapshots in memory for the end-of-run summary
#[derive(Debug, Clone, Default)]
pub struct StatsAggregator {
    last: Option<(Instant, LoggerStats)>,
    latest: LoggerStats,
    sinks: Vec<SinkStats>,
    /// Records dispatched per second between snapshots
    dispatch_rate: RunningStats,
    queue_depth: RunningStats,
    samples: u64,
}

impl StatsAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, logger: &LoggerStats, sinks: &[SinkStats]) {
        self.update_at(Instant::now(), logger, sinks);
    }

    /// Record a snapshot taken at `at`
    pub fn update_at(&mut self, at: Instant, logger: &LoggerStats, sinks: &[SinkStats]) {
        if let Some((previous_at, previous)) = &self.last {
            let elapsed = at.saturating_duration_since(*previous_at).as_secs_f64();
            if elapsed > 0.0 {
                let delta = logger.dispatched.saturating_sub(previous.dispatched);
                self.dispatch_rate.push(delta as f64 / elapsed);
            }
        }
        self.queue_depth.push(logger.queue_len as f64);
        self.samples += 1;
        self.last = Some((at, *logger));
        self.latest = *logger;
        self.sinks = sinks.to_vec();
    }

    pub fn samples(&self) -> u64 {
        self.samples
    }

    pub fn summary(&self) -> ThroughputSummary {
        let offered = self.latest.submitted + self.latest.dropped;
        ThroughputSummary {
            submitted: self.latest.submitted,
            dispatched: self.latest.dispatched,
            dropped: self.latest.dropped,
            drop_rate: if offered > 0 {
                self.latest.dropped as f64 / offered as f64 * 100.0
            } else {
                0.0
            },
            dispatch_rate: StatsSummary::from(&self.dispatch_rate),
            queue_depth: StatsSummary::from(&self.queue_depth),
            sinks: self.sinks.clone(),
        }
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

/// End-of-run summary
#[derive(Debug, Clone, Default)]
pub struct ThroughputSummary {
    pub submitted: u64,
    pub dispatched: u64,
    pub dropped: u64,
    /// Dropped share of all offered records, in percent
    pub drop_rate: f64,
    pub dispatch_rate: StatsSummary,
    pub queue_depth: StatsSummary,
    pub sinks: Vec<SinkStats>,
}

impl fmt::Display for ThroughputSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "=== reglog summary ===")?;
        writeln!(f, "Submitted: {}", self.submitted)?;
        writeln!(f, "Dispatched: {}", self.dispatched)?;
        writeln!(f, "Dropped: {} ({:.2}%)", self.dropped, self.drop_rate)?;
        writeln!(f, "Dispatch rate (rec/s): {}", self.dispatch_rate)?;
        writeln!(f, "Queue depth: {}", self.queue_depth)?;

        if !self.sinks.is_empty() {
            writeln!(f, "Sinks:")?;
            for sink in &self.sinks {
                writeln!(
                    f,
                    "  {}: written={} dropped={} failures={} rotations={} queued={}",
                    sink.name, sink.written, sink.dropped, sink.failures, sink.rotations, sink.queued
                )?;
            }
        }
        Ok(())
    }
}

/// Summary of one running statistic
#[derive(Debug, Clone, Default)]
pub struct StatsSummary {
    pub count: u64,
    pub min: f64,
    pub max: f64,
    pub mean: f64,
    pub std_dev: f64,
}

impl From<&RunningStats> for StatsSummary {
    fn from(stats: &RunningStats) -> Self {
        Self {
            count: stats.count,
            min: stats.min,
            max: stats.max,
            mean: stats.mean(),
            std_dev: stats.std_dev(),
        }
    }
}

impl fmt::Display for StatsSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.count == 0 {
            write!(f, "N/A")
        } else {
            write!(
                f,
                "min={:.1}, max={:.1}, mean={:.1}, std={:.1} (n={})",
                self.min, self.max, self.mean, self.std_dev, self.count
            )
        }
    }
}

/// Online mean/variance (Welford)
#[derive(Debug, Clone, Default)]
pub struct RunningStats {
    count: u64,
    mean: f64,
    m2: f64,
    min: f64,
    max: f64,
}

impl RunningStats {
    pub fn push(&mut self, value: f64) {
        self.count += 1;
        if self.count == 1 {
            self.min = value;
            self.max = value;
            self.mean = value;
            self.m2 = 0.0;
            return;
        }
        self.min = self.min.min(value);
        self.max = self.max.max(value);
        let delta = value - self.mean;
        self.mean += delta / self.count as f64;
        self.m2 += delta * (value - self.mean);
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn mean(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.mean
        }
    }

    /// Sample variance
    pub fn variance(&self) -> f64 {
        if self.count < 2 {
            0.0
        } else {
            self.m2 / (self.count - 1) as f64
        }
    }

    pub fn std_dev(&self) -> f64 {
        self.variance().sqrt()
    }

    pub fn min(&self) -> f64 {
        self.min
    }

    pub fn max(&self) -> f64 {
        self.max
    }
}
