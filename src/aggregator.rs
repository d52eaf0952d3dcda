use tracing::{debug, warn};

use crate::packet::{PacketRecord, ThroughputSample};

/// Minimum time a bucket must span before it is closed, in seconds.
pub const DEFAULT_BUCKET_SPAN: f64 = 0.1;

/// Per-file counters. Reset only by constructing a new aggregator.
#[derive(Debug, Default)]
struct AggregationState {
    bucket_start: f64,
    bytes: f64,
    elapsed: f64,
    last_time: f64,
}

/// Totals handed back once a file's record stream is exhausted.
#[derive(Debug, Clone, PartialEq)]
pub struct AggregationSummary {
    pub records_seen: u64,
    pub records_matched: u64,
    pub samples: u64,
    /// Bytes accumulated after the last closed bucket.
    pub pending_bytes: f64,
    /// The unclosed trailing bucket as a sample, if it has bytes and a
    /// positive span. Only written out when explicitly requested.
    pub partial: Option<ThroughputSample>,
}

/// Folds a time-ordered record stream into throughput samples, one per
/// bucket of at least `min_span` seconds.
#[derive(Debug)]
pub struct Aggregator<'a> {
    destination: &'a str,
    min_span: f64,
    state: AggregationState,
    records_seen: u64,
    records_matched: u64,
    samples: u64,
    regression_logged: bool,
}

impl<'a> Aggregator<'a> {
    pub fn new(destination: &'a str, min_span: f64) -> Self {
        Self {
            destination,
            min_span,
            state: AggregationState::default(),
            records_seen: 0,
            records_matched: 0,
            samples: 0,
            regression_logged: false,
        }
    }

    /// Feed one record; returns a sample when it closes the current bucket.
    pub fn push(&mut self, record: &PacketRecord) -> Option<ThroughputSample> {
        self.records_seen += 1;
        if record.destination_address != self.destination {
            return None;
        }
        self.records_matched += 1;

        let t = record.relative_time;
        if t < self.state.last_time && !self.regression_logged {
            warn!(
                "Timestamp went backwards at record {} ({:.6}s < {:.6}s); buckets may be skewed",
                self.records_seen, t, self.state.last_time
            );
            self.regression_logged = true;
        }
        self.state.last_time = t;
        self.state.bytes += record.byte_length;

        let span = t - self.state.bucket_start;
        if span > self.min_span {
            let sample = ThroughputSample::from_bytes(self.state.elapsed, self.state.bytes, span);
            debug!(
                "Closed bucket [{:.6}, {:.6}]: {} bytes, {:.6} Mbps",
                self.state.bucket_start, t, self.state.bytes, sample.throughput_mbps
            );

            self.state.elapsed += span;
            self.state.bucket_start = t;
            self.state.bytes = 0.0;
            self.samples += 1;
            Some(sample)
        } else {
            None
        }
    }

    pub fn finish(self) -> AggregationSummary {
        let span = self.state.last_time - self.state.bucket_start;
        let partial = if self.state.bytes > 0.0 && span > 0.0 {
            Some(ThroughputSample::from_bytes(self.state.elapsed, self.state.bytes, span))
        } else {
            None
        };

        AggregationSummary {
            records_seen: self.records_seen,
            records_matched: self.records_matched,
            samples: self.samples,
            pending_bytes: self.state.bytes,
            partial,
        }
    }
}
