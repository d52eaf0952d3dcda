/// One dissected packet, as produced by a record source.
#[derive(Debug, Clone, PartialEq)]
pub struct PacketRecord {
    pub relative_time: f64,       // Seconds since the first frame of the capture
    pub byte_length: f64,         // Frame length on the wire
    pub destination_address: String,
}

impl PacketRecord {
    pub fn new(relative_time: f64, byte_length: f64, destination_address: impl Into<String>) -> Self {
        Self {
            relative_time,
            byte_length,
            destination_address: destination_address.into(),
        }
    }
}

/// Average rate over one closed bucket.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ThroughputSample {
    pub elapsed: f64,
    pub throughput_mbps: f64,
}

impl ThroughputSample {
    /// Build a sample from a byte count observed over `span` seconds.
    pub fn from_bytes(elapsed: f64, bytes: f64, span: f64) -> Self {
        let rate = bytes / span;
        Self {
            elapsed,
            throughput_mbps: rate * 8.0 / 1_000_000.0,
        }
    }
}
