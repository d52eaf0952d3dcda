use anyhow::{Context, Result};
use clap::Parser;
use std::fs;
use std::path::PathBuf;
use std::time::Instant;
use tracing::info;

mod aggregator;
mod config;
mod dissector;
mod error;
mod job;
mod packet;
mod pcap_reader;
mod plot_writer;
mod record_parser;

use config::{Backend, DEFAULT_DESTINATION, RunConfig};

#[derive(Parser, Debug)]
#[command(name = "udp-throughput")]
#[command(about = "Plot UDP throughput over time from packet captures")]
#[command(version)]
struct Args {
    /// Capture files to process; each gets its own TP-<name>UDP.plotme
    #[arg(required = true)]
    files: Vec<PathBuf>,

    /// UDP port the dissection is filtered to
    #[arg(short, long, default_value = "50001")]
    port: u16,

    /// Destination address whose incoming traffic is measured
    #[arg(short, long, default_value = DEFAULT_DESTINATION)]
    destination: String,

    /// Minimum bucket span in seconds
    #[arg(short, long, default_value = "0.1")]
    bucket: f64,

    /// Where packet records come from
    #[arg(long, value_enum, default_value = "tshark")]
    backend: Backend,

    /// tshark executable to run
    #[arg(long, default_value = "tshark")]
    tshark: PathBuf,

    /// Run tshark through sudo
    #[arg(long, default_value = "false")]
    sudo: bool,

    /// Directory for series files (default: next to each capture)
    #[arg(short, long)]
    output_dir: Option<PathBuf>,

    /// Keep tshark's field dump instead of deleting it
    #[arg(long, default_value = "false")]
    keep_intermediate: bool,

    /// Also write the trailing bucket that never reached the minimum span
    #[arg(long, default_value = "false")]
    flush_partial: bool,

    /// Captures processed concurrently (0 = one per CPU)
    #[arg(short, long, default_value = "1")]
    jobs: usize,

    /// Verbose logging (default: false)
    #[arg(short, long, default_value = "false")]
    verbose: bool,
}

impl Args {
    fn run_config(&self) -> Result<RunConfig> {
        RunConfig {
            port: self.port,
            destination: self.destination.clone(),
            bucket_span: self.bucket,
            backend: self.backend,
            tshark: self.tshark.clone(),
            sudo: self.sudo,
            output_dir: self.output_dir.clone(),
            keep_intermediate: self.keep_intermediate,
            flush_partial: self.flush_partial,
            jobs: self.jobs,
        }
        .validate()
        .context("Invalid arguments")
    }
}

fn main() -> Result<()> {
    let args = Args::parse();

    let log_level = if args.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(log_level)
        .init();

    let config = args.run_config()?;
    if let Some(dir) = &config.output_dir {
        fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create output directory {}", dir.display()))?;
    }

    let source = config.record_source();
    info!("Destination: {} on UDP port {}", config.destination, config.port);
    info!("Bucket span: {}s, record source: {}", config.bucket_span, source.name());

    let start_time = Instant::now();
    let reports = job::run_all(&config, source.as_ref(), &args.files)?;

    let samples: u64 = reports.iter().map(|r| r.samples).sum();
    let matched: u64 = reports.iter().map(|r| r.records_matched).sum();
    let dropped: f64 = reports.iter().map(|r| r.dropped_bytes).sum();

    info!("======= THROUGHPUT SUMMARY =======");
    info!("Captures processed: {}", reports.len());
    info!("Matching records: {}", matched);
    info!("Samples written: {}", samples);
    if !config.flush_partial {
        info!("Bytes in dropped trailing buckets: {}", dropped);
    }
    info!("Total time: {:.2} seconds", start_time.elapsed().as_secs_f64());
    info!("==================================");

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let args = Args::try_parse_from(["udp-throughput", "a.pcap", "b.pcap"]).unwrap();
        assert_eq!(args.files, [PathBuf::from("a.pcap"), PathBuf::from("b.pcap")]);

        let config = args.run_config().unwrap();
        assert_eq!(config.port, 50001);
        assert_eq!(config.destination, "10.0.9.2");
        assert_eq!(config.bucket_span, 0.1);
        assert_eq!(config.backend, Backend::Tshark);
        assert_eq!(config.jobs, 1);
    }

    #[test]
    fn test_requires_a_capture() {
        assert!(Args::try_parse_from(["udp-throughput"]).is_err());
    }

    #[test]
    fn test_flags() {
        let args = Args::try_parse_from([
            "udp-throughput",
            "--backend",
            "pcap",
            "-p",
            "9",
            "-d",
            "10.1.1.2",
            "-b",
            "0.5",
            "-j",
            "0",
            "--flush-partial",
            "trace.pcap",
        ])
        .unwrap();

        let config = args.run_config().unwrap();
        assert_eq!(config.backend, Backend::Pcap);
        assert_eq!(config.port, 9);
        assert_eq!(config.destination, "10.1.1.2");
        assert_eq!(config.bucket_span, 0.5);
        assert_eq!(config.jobs, 0);
        assert!(config.flush_partial);
    }

    #[test]
    fn test_invalid_bucket_rejected() {
        let args = Args::try_parse_from(["udp-throughput", "-b", "0", "trace.pcap"]).unwrap();
        assert!(args.run_config().is_err());
    }

    #[test]
    fn test_cli_is_well_formed() {
        use clap::CommandFactory;
        Args::command().debug_assert();
    }
}
