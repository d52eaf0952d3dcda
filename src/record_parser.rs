use std::io::{BufRead, Lines};
use std::path::{Path, PathBuf};

use crate::error::{Error, ParseRecordError};
use crate::packet::PacketRecord;

/// relative time, frame length, destination address
const NR_FIELDS: usize = 3;

/// Decode one `time<TAB>length<TAB>address` line as emitted by
/// `tshark -T fields -e frame.time_relative -e frame.len -e ip.dst`.
pub fn parse_record_line(line: &str) -> Result<PacketRecord, ParseRecordError> {
    let line = line.trim_end_matches(['\n', '\r']);
    let fields = line.split('\t').collect::<Vec<_>>();
    if fields.len() != NR_FIELDS {
        return Err(ParseRecordError::WrongNrFields {
            expected: NR_FIELDS,
            got: fields.len(),
        });
    }

    let relative_time = parse_number("frame.time_relative", fields[0])?;
    let byte_length = parse_number("frame.len", fields[1])?;

    Ok(PacketRecord::new(relative_time, byte_length, fields[2]))
}

fn parse_number(field: &'static str, value: &str) -> Result<f64, ParseRecordError> {
    value.trim().parse::<f64>().map_err(|_| ParseRecordError::BadNumber {
        field,
        value: value.to_string(),
    })
}

/// Lazily decodes field lines from a reader, tagging failures with the file
/// and line they came from.
pub struct FieldRecords<R> {
    lines: Lines<R>,
    path: PathBuf,
    line_number: usize,
}

impl<R: BufRead> FieldRecords<R> {
    pub fn new(reader: R, path: &Path) -> Self {
        Self {
            lines: reader.lines(),
            path: path.to_path_buf(),
            line_number: 0,
        }
    }
}

impl<R: BufRead> Iterator for FieldRecords<R> {
    type Item = Result<PacketRecord, Error>;

    fn next(&mut self) -> Option<Self::Item> {
        let line = match self.lines.next()? {
            Ok(line) => line,
            Err(e) => return Some(Err(Error::filesystem(&self.path, e))),
        };
        self.line_number += 1;

        Some(parse_record_line(&line).map_err(|source| Error::Parse {
            path: self.path.clone(),
            line: self.line_number,
            source,
        }))
    }
}
