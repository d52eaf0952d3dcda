use std::fs::{self, File};
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use tracing::{debug, warn};

use crate::error::Error;
use crate::packet::PacketRecord;
use crate::plot_writer::capture_stem;
use crate::record_parser::FieldRecords;

/// Lazy, single-pass stream of records for one capture.
pub type RecordStream = Box<dyn Iterator<Item = Result<PacketRecord, Error>>>;

/// Records for one capture, plus any on-disk artifact the source left behind
/// that must be removed once the records have been consumed.
pub struct Dissection {
    pub records: RecordStream,
    pub artifact: Option<PathBuf>,
}

/// Turns a capture file into a record stream filtered to one UDP port.
pub trait RecordSource: Send + Sync {
    fn name(&self) -> &'static str;

    fn dissect(&self, capture: &Path) -> Result<Dissection, Error>;
}

/// Where the tshark field dump for `capture` is written: `<dir>/<stem>.csv`,
/// or `<dir>/<stem>.fields.csv` when the capture itself is `<stem>.csv`.
pub fn intermediate_path(capture: &Path) -> PathBuf {
    let dump_at = |suffix: &str| {
        let mut name = capture_stem(capture);
        name.push(suffix);
        match capture.parent() {
            Some(dir) => dir.join(name),
            None => PathBuf::from(name),
        }
    };

    let dump = dump_at(".csv");
    if dump == capture {
        dump_at(".fields.csv")
    } else {
        dump
    }
}

/// Runs `tshark -T fields` on each capture and streams its output back from
/// the intermediate dump file.
#[derive(Debug, Clone)]
pub struct TsharkDissector {
    program: PathBuf,
    port: u16,
    sudo: bool,
}

impl TsharkDissector {
    pub fn new(program: impl Into<PathBuf>, port: u16, sudo: bool) -> Self {
        Self {
            program: program.into(),
            port,
            sudo,
        }
    }

    fn command(&self, capture: &Path) -> Command {
        let mut command = if self.sudo {
            let mut sudo = Command::new("sudo");
            sudo.arg(&self.program);
            sudo
        } else {
            Command::new(&self.program)
        };

        command
            .arg("-r")
            .arg(capture)
            .args(["-T", "fields"])
            .args(["-e", "frame.time_relative"])
            .args(["-e", "frame.len"])
            .args(["-e", "ip.dst"])
            .arg(format!("udp.port == {}", self.port));
        command
    }

    fn discard(artifact: &Path) {
        if let Err(e) = fs::remove_file(artifact) {
            warn!("Failed to remove {}: {}", artifact.display(), e);
        }
    }
}

impl RecordSource for TsharkDissector {
    fn name(&self) -> &'static str {
        "tshark"
    }

    fn dissect(&self, capture: &Path) -> Result<Dissection, Error> {
        if !capture.is_file() {
            return Err(Error::dissection(capture, "capture file not found"));
        }

        let artifact = intermediate_path(capture);
        if artifact == capture {
            return Err(Error::dissection(capture, "intermediate dump would overwrite the capture"));
        }
        let dump = File::create(&artifact).map_err(|e| Error::filesystem(&artifact, e))?;

        let mut command = self.command(capture);
        debug!("Running {:?} > {}", command, artifact.display());

        let output = match command
            .stdin(Stdio::null())
            .stdout(Stdio::from(dump))
            .stderr(Stdio::piped())
            .output()
        {
            Ok(output) => output,
            Err(e) => {
                Self::discard(&artifact);
                return Err(Error::dissection(
                    capture,
                    format!("failed to run {}: {}", self.program.display(), e),
                ));
            }
        };

        let stderr = String::from_utf8_lossy(&output.stderr);
        if !output.status.success() {
            Self::discard(&artifact);
            return Err(Error::dissection(
                capture,
                format!("{} exited with {}: {}", self.program.display(), output.status, stderr.trim()),
            ));
        }
        if !stderr.trim().is_empty() {
            debug!("tshark stderr for {}: {}", capture.display(), stderr.trim());
        }

        let dump = File::open(&artifact).map_err(|e| Error::filesystem(&artifact, e))?;
        let records = FieldRecords::new(BufReader::new(dump), &artifact);

        Ok(Dissection {
            records: Box::new(records),
            artifact: Some(artifact),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_intermediate_path() {
        assert_eq!(
            intermediate_path(Path::new("traces/third-0-1.pcap")),
            PathBuf::from("traces/third-0-1.csv")
        );
        assert_eq!(intermediate_path(Path::new("a.pcap")), PathBuf::from("a.csv"));
    }

    #[test]
    fn test_intermediate_path_never_the_capture() {
        assert_eq!(
            intermediate_path(Path::new("traces/trace.csv")),
            PathBuf::from("traces/trace.fields.csv")
        );
        assert_eq!(intermediate_path(Path::new("trace.csv")), PathBuf::from("trace.fields.csv"));
    }

    #[test]
    fn test_command_line() {
        let dissector = TsharkDissector::new("tshark", 50001, false);
        let command = dissector.command(Path::new("a.pcap"));
        assert_eq!(command.get_program(), "tshark");
        let args = command.get_args().collect::<Vec<_>>();
        assert_eq!(
            args,
            [
                "-r",
                "a.pcap",
                "-T",
                "fields",
                "-e",
                "frame.time_relative",
                "-e",
                "frame.len",
                "-e",
                "ip.dst",
                "udp.port == 50001",
            ]
        );

        let dissector = TsharkDissector::new("/usr/bin/tshark", 9, true);
        let command = dissector.command(Path::new("a.pcap"));
        assert_eq!(command.get_program(), "sudo");
        let args = command.get_args().collect::<Vec<_>>();
        assert_eq!(args[0], "/usr/bin/tshark");
        assert_eq!(args.last().unwrap(), &"udp.port == 9");
    }

    #[test]
    fn test_missing_capture() {
        let dir = tempfile::tempdir().unwrap();
        let capture = dir.path().join("missing.pcap");
        let dissector = TsharkDissector::new("tshark", 50001, false);

        assert!(matches!(
            dissector.dissect(&capture),
            Err(Error::Dissection { .. })
        ));
        assert!(!intermediate_path(&capture).exists());
    }

    #[test]
    fn test_missing_program_cleans_up() {
        let dir = tempfile::tempdir().unwrap();
        let capture = dir.path().join("trace.pcap");
        fs::write(&capture, b"not really a capture").unwrap();
        let dissector = TsharkDissector::new(dir.path().join("no-such-tshark"), 50001, false);

        match dissector.dissect(&capture) {
            Err(Error::Dissection { path, reason }) => {
                assert_eq!(path, capture);
                assert!(reason.contains("failed to run"));
            }
            Err(e) => panic!("unexpected error: {}", e),
            Ok(_) => panic!("dissection should fail"),
        }
        assert!(!intermediate_path(&capture).exists());
    }

    #[cfg(unix)]
    fn fake_tshark(dir: &Path, body: &str) -> PathBuf {
        use std::os::unix::fs::PermissionsExt;

        let program = dir.join("fake-tshark");
        fs::write(&program, format!("#!/bin/sh\n{}\n", body)).unwrap();
        fs::set_permissions(&program, fs::Permissions::from_mode(0o755)).unwrap();
        program
    }

    #[cfg(unix)]
    #[test]
    fn test_streams_tshark_output() {
        let dir = tempfile::tempdir().unwrap();
        let capture = dir.path().join("trace.pcap");
        fs::write(&capture, b"").unwrap();
        let program = fake_tshark(
            dir.path(),
            r"printf '0.000000000\t100\t10.0.9.2\n0.150000000\t200\t10.0.0.1\n'",
        );

        let dissection = TsharkDissector::new(program, 50001, false)
            .dissect(&capture)
            .unwrap();
        let artifact = dissection.artifact.clone().unwrap();
        assert_eq!(artifact, dir.path().join("trace.csv"));
        assert!(artifact.exists());

        let records = dissection.records.collect::<Result<Vec<_>, _>>().unwrap();
        assert_eq!(
            records,
            vec![
                PacketRecord::new(0.0, 100.0, "10.0.9.2"),
                PacketRecord::new(0.15, 200.0, "10.0.0.1"),
            ]
        );
    }

    #[cfg(unix)]
    #[test]
    fn test_nonzero_exit_is_dissection_error() {
        let dir = tempfile::tempdir().unwrap();
        let capture = dir.path().join("trace.pcap");
        fs::write(&capture, b"").unwrap();
        let program = fake_tshark(dir.path(), "echo 'not a capture file' >&2; exit 2");

        match TsharkDissector::new(program, 50001, false).dissect(&capture) {
            Err(Error::Dissection { reason, .. }) => {
                assert!(reason.contains("not a capture file"));
            }
            Err(e) => panic!("unexpected error: {}", e),
            Ok(_) => panic!("dissection should fail"),
        }
        assert!(!dir.path().join("trace.csv").exists());
    }

    #[cfg(unix)]
    #[test]
    fn test_failed_run_keeps_csv_named_capture() {
        let dir = tempfile::tempdir().unwrap();
        let capture = dir.path().join("trace.csv");
        fs::write(&capture, b"capture bytes").unwrap();
        let program = fake_tshark(dir.path(), "exit 2");

        assert!(matches!(
            TsharkDissector::new(program, 50001, false).dissect(&capture),
            Err(Error::Dissection { .. })
        ));
        assert_eq!(fs::read(&capture).unwrap(), b"capture bytes");
        assert!(!dir.path().join("trace.fields.csv").exists());
    }

    #[cfg(unix)]
    #[test]
    fn test_csv_named_capture_dumps_beside_it() {
        let dir = tempfile::tempdir().unwrap();
        let capture = dir.path().join("trace.csv");
        fs::write(&capture, b"capture bytes").unwrap();
        let program = fake_tshark(dir.path(), r"printf '0.0\t100\t10.0.9.2\n'");

        let dissection = TsharkDissector::new(program, 50001, false)
            .dissect(&capture)
            .unwrap();
        assert_eq!(dissection.artifact, Some(dir.path().join("trace.fields.csv")));
        assert_eq!(fs::read(&capture).unwrap(), b"capture bytes");
        assert_eq!(dissection.records.count(), 1);
    }
}
