use anyhow::{Result, anyhow, bail};
use crossbeam_queue::SegQueue;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, info, warn};

use crate::aggregator::Aggregator;
use crate::config::{Backend, RunConfig};
use crate::dissector::{RecordSource, RecordStream, intermediate_path};
use crate::error::Error;
use crate::plot_writer::{PlotWriter, series_path};

/// Outcome of turning one capture into a series file.
#[derive(Debug, Clone)]
pub struct FileReport {
    pub capture: PathBuf,
    pub output: PathBuf,
    pub records_seen: u64,
    pub records_matched: u64,
    pub samples: u64,
    /// Bytes in the trailing bucket that never closed (0 when flushed)
    pub dropped_bytes: f64,
}

/// Dissect, aggregate and write the series for a single capture.
pub fn process_capture(config: &RunConfig, source: &dyn RecordSource, capture: &Path) -> Result<FileReport, Error> {
    info!("Processing {} with {}", capture.display(), source.name());

    let dissection = source.dissect(capture)?;
    let output = series_path(capture, config.output_dir.as_deref());

    match write_series(config, dissection.records, capture, &output) {
        Ok(report) => {
            if let Some(artifact) = &dissection.artifact {
                if config.keep_intermediate {
                    debug!("Keeping {}", artifact.display());
                } else {
                    fs::remove_file(artifact).map_err(|e| Error::filesystem(artifact, e))?;
                }
            }
            Ok(report)
        }
        Err(e) => {
            // No half-written series survives a failed file
            if output.exists() {
                if let Err(remove_err) = fs::remove_file(&output) {
                    warn!("Failed to remove partial {}: {}", output.display(), remove_err);
                }
            }
            if let Some(artifact) = &dissection.artifact {
                warn!("Leaving {} in place for inspection", artifact.display());
            }
            Err(e)
        }
    }
}

fn write_series(config: &RunConfig, records: RecordStream, capture: &Path, output: &Path) -> Result<FileReport, Error> {
    let mut writer = PlotWriter::create(output)?;
    let mut aggregator = Aggregator::new(&config.destination, config.bucket_span);

    for record in records {
        if let Some(sample) = aggregator.push(&record?) {
            writer.write_sample(&sample)?;
        }
    }

    let summary = aggregator.finish();
    let mut dropped_bytes = summary.pending_bytes;
    if config.flush_partial {
        if let Some(partial) = &summary.partial {
            writer.write_sample(partial)?;
            dropped_bytes = 0.0;
        }
    }
    if dropped_bytes > 0.0 {
        debug!("Dropped {} bytes in the unclosed trailing bucket", dropped_bytes);
    }

    let samples = writer.finish()?;

    Ok(FileReport {
        capture: capture.to_path_buf(),
        output: output.to_path_buf(),
        records_seen: summary.records_seen,
        records_matched: summary.records_matched,
        samples,
        dropped_bytes,
    })
}

/// Process every capture, in order, stopping at the first failure.
///
/// With more than one worker the captures are pulled from a shared queue;
/// each worker owns its aggregator, so nothing but the queue and the result
/// slots is shared. Reports come back in input order.
pub fn run_all(config: &RunConfig, source: &dyn RecordSource, captures: &[PathBuf]) -> Result<Vec<FileReport>> {
    check_distinct_paths(config, captures)?;

    let worker_count = config.worker_count(captures.len());
    if worker_count <= 1 {
        let mut reports = Vec::with_capacity(captures.len());
        for capture in captures {
            let report = process_capture(config, source, capture)?;
            log_report(&report);
            reports.push(report);
        }
        return Ok(reports);
    }

    info!("Processing {} captures with {} workers", captures.len(), worker_count);

    let queue = SegQueue::new();
    for (index, capture) in captures.iter().enumerate() {
        queue.push((index, capture));
    }
    let slots: Mutex<Vec<Option<FileReport>>> = Mutex::new(vec![None; captures.len()]);
    let failure: Mutex<Option<Error>> = Mutex::new(None);
    let running = AtomicBool::new(true);

    crossbeam_utils::thread::scope(|scope| {
        for worker_id in 0..worker_count {
            let (queue, slots, failure, running) = (&queue, &slots, &failure, &running);
            scope.spawn(move |_| {
                while running.load(Ordering::Relaxed) {
                    let Some((index, capture)) = queue.pop() else {
                        break;
                    };
                    debug!("Worker {} picked up {}", worker_id, capture.display());

                    match process_capture(config, source, capture) {
                        Ok(report) => {
                            log_report(&report);
                            slots.lock()[index] = Some(report);
                        }
                        Err(e) => {
                            running.store(false, Ordering::Relaxed);
                            failure.lock().get_or_insert(e);
                        }
                    }
                }
                debug!("Worker {} shutting down", worker_id);
            });
        }
    })
    .map_err(|_| anyhow!("a worker thread panicked"))?;

    if let Some(e) = failure.into_inner() {
        return Err(e.into());
    }
    Ok(slots.into_inner().into_iter().flatten().collect())
}

/// Every capture must own its series file and tshark dump; two inputs
/// sharing one (`run.pcap` and `run.pcapng`) would overwrite each other.
fn check_distinct_paths(config: &RunConfig, captures: &[PathBuf]) -> Result<()> {
    let mut owners: HashMap<PathBuf, &Path> = HashMap::new();
    for capture in captures {
        if owners.insert(capture.clone(), capture).is_some() {
            bail!("{} is given more than once", capture.display());
        }
    }

    for capture in captures {
        let mut claimed = vec![series_path(capture, config.output_dir.as_deref())];
        if config.backend == Backend::Tshark {
            claimed.push(intermediate_path(capture));
        }

        for path in claimed {
            if let Some(owner) = owners.insert(path.clone(), capture) {
                bail!(
                    "{} and {} would both use {}",
                    owner.display(),
                    capture.display(),
                    path.display()
                );
            }
        }
    }
    Ok(())
}

fn log_report(report: &FileReport) {
    info!(
        "{}: {} records, {} matched, {} samples -> {}",
        report.capture.display(),
        report.records_seen,
        report.records_matched,
        report.samples,
        report.output.display()
    );
}
