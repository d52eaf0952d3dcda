use anyhow::{Result, bail};
use clap::ValueEnum;
use std::path::PathBuf;

use crate::aggregator::DEFAULT_BUCKET_SPAN;
use crate::dissector::{RecordSource, TsharkDissector};
use crate::pcap_reader::PcapSource;

pub const DEFAULT_PORT: u16 = 50001;
pub const DEFAULT_DESTINATION: &str = "10.0.9.2";

/// How packet records are pulled out of a capture
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Backend {
    /// Run tshark and parse its field output
    Tshark,
    /// Decode the capture in-process with libpcap
    Pcap,
}

/// Validated settings for one run over a set of captures.
#[derive(Debug, Clone)]
pub struct RunConfig {
    pub port: u16,
    pub destination: String,
    pub bucket_span: f64,
    pub backend: Backend,
    pub tshark: PathBuf,
    pub sudo: bool,
    pub output_dir: Option<PathBuf>,
    pub keep_intermediate: bool,
    pub flush_partial: bool,
    /// 0 means one worker per CPU
    pub jobs: usize,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            destination: DEFAULT_DESTINATION.to_string(),
            bucket_span: DEFAULT_BUCKET_SPAN,
            backend: Backend::Tshark,
            tshark: PathBuf::from("tshark"),
            sudo: false,
            output_dir: None,
            keep_intermediate: false,
            flush_partial: false,
            jobs: 1,
        }
    }
}

impl RunConfig {
    pub fn validate(self) -> Result<Self> {
        if !self.bucket_span.is_finite() || self.bucket_span <= 0.0 {
            bail!("bucket span must be a positive number of seconds, got {}", self.bucket_span);
        }
        if self.destination.trim().is_empty() {
            bail!("destination address must not be empty");
        }
        if let Some(dir) = &self.output_dir {
            if dir.exists() && !dir.is_dir() {
                bail!("output path {} is not a directory", dir.display());
            }
        }
        Ok(self)
    }

    /// Worker threads to use for `files` captures.
    pub fn worker_count(&self, files: usize) -> usize {
        let requested = if self.jobs == 0 { num_cpus::get() } else { self.jobs };
        requested.min(files).max(1)
    }

    pub fn record_source(&self) -> Box<dyn RecordSource> {
        match self.backend {
            Backend::Tshark => Box::new(TsharkDissector::new(self.tshark.clone(), self.port, self.sudo)),
            Backend::Pcap => Box::new(PcapSource::new(self.port)),
        }
    }
}
