use std::ffi::OsString;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use crate::error::Error;
use crate::packet::ThroughputSample;

/// Capture name without its final extension: `run/third-0-1.pcap` -> `third-0-1`.
pub fn capture_stem(capture: &Path) -> OsString {
    capture
        .file_stem()
        .or_else(|| capture.file_name())
        .map(|s| s.to_os_string())
        .unwrap_or_else(|| OsString::from("capture"))
}

/// `TP-<stem>UDP.plotme`, next to the capture unless `output_dir` is given.
pub fn series_path(capture: &Path, output_dir: Option<&Path>) -> PathBuf {
    let mut name = OsString::from("TP-");
    name.push(capture_stem(capture));
    name.push("UDP.plotme");

    let dir = output_dir
        .map(Path::to_path_buf)
        .or_else(|| capture.parent().map(Path::to_path_buf))
        .unwrap_or_default();
    dir.join(name)
}

/// Writes `<elapsed> <throughput_mbps>` lines for a gnuplot-style plotter.
pub struct PlotWriter {
    writer: BufWriter<File>,
    path: PathBuf,
    lines: u64,
}

impl PlotWriter {
    pub fn create(path: &Path) -> Result<Self, Error> {
        let file = File::create(path).map_err(|e| Error::filesystem(path, e))?;
        Ok(Self {
            writer: BufWriter::new(file),
            path: path.to_path_buf(),
            lines: 0,
        })
    }

    pub fn write_sample(&mut self, sample: &ThroughputSample) -> Result<(), Error> {
        // Debug formatting keeps the trailing ".0" on integral values
        writeln!(self.writer, "{:?} {:?}", sample.elapsed, sample.throughput_mbps)
            .map_err(|e| Error::filesystem(&self.path, e))?;
        self.lines += 1;
        Ok(())
    }

    /// Flush and close; returns the number of lines written.
    pub fn finish(mut self) -> Result<u64, Error> {
        self.writer
            .flush()
            .map_err(|e| Error::filesystem(&self.path, e))?;
        Ok(self.lines)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn test_series_path_next_to_capture() {
        assert_eq!(
            series_path(Path::new("traces/third-0-1.pcap"), None),
            PathBuf::from("traces/TP-third-0-1UDP.plotme")
        );
        assert_eq!(
            series_path(Path::new("third-0-1.pcap"), None),
            PathBuf::from("TP-third-0-1UDP.plotme")
        );
    }

    #[test]
    fn test_series_path_strips_only_last_extension() {
        assert_eq!(
            series_path(Path::new("run.v2.pcap"), None),
            PathBuf::from("TP-run.v2UDP.plotme")
        );
        assert_eq!(
            series_path(Path::new("capture"), None),
            PathBuf::from("TP-captureUDP.plotme")
        );
    }

    #[test]
    fn test_series_path_with_output_dir() {
        assert_eq!(
            series_path(Path::new("traces/a.pcap"), Some(Path::new("plots"))),
            PathBuf::from("plots/TP-aUDP.plotme")
        );
    }

    #[test]
    fn test_writes_space_separated_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("TP-xUDP.plotme");

        let mut writer = PlotWriter::create(&path).unwrap();
        writer
            .write_sample(&ThroughputSample { elapsed: 0.0, throughput_mbps: 0.016 })
            .unwrap();
        writer
            .write_sample(&ThroughputSample { elapsed: 0.15, throughput_mbps: 2.0 })
            .unwrap();
        assert_eq!(writer.finish().unwrap(), 2);

        assert_eq!(fs::read_to_string(&path).unwrap(), "0.0 0.016\n0.15 2.0\n");
    }

    #[test]
    fn test_create_in_missing_directory_fails() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing").join("TP-xUDP.plotme");
        assert!(matches!(PlotWriter::create(&path), Err(Error::Filesystem { .. })));
    }
}
