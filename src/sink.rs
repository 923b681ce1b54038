use std::{
    fs::{File, OpenOptions},
    io::{self, BufRead, BufReader, BufWriter, Write},
    path::{Path, PathBuf},
};

use tabled::{builder::Builder, settings::Style};

use crate::{
    cpu::CpuId,
    error::{new_error, new_io_error, Error, ErrorKind},
    sample::RawSample,
};

/// Where measurement records go: standard output, or a record file.
///
/// Records are written one sample per line as `CPU:Value:Unit:Event`. Files
/// are only ever appended to, so writing the samples of every iteration of a
/// session to the same sink accumulates them into one file.
///
/// ```no_run
/// use pmc_session::{RawSample, ResultSink};
///
/// let sink = ResultSink::file("out/results.txt");
/// sink.write(&[RawSample::new(0, 42, None, "cycles")])?;
///
/// let records = ResultSink::read("out/results.txt")?;
/// #
/// # Ok::<(), pmc_session::Error>(())
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResultSink {
    destination: Option<PathBuf>,
}

impl ResultSink {
    /// A sink writing to `destination`, or to standard output if `None`.
    pub fn new(destination: Option<PathBuf>) -> Self {
        ResultSink { destination }
    }

    pub fn stdout() -> Self {
        ResultSink { destination: None }
    }

    /// A sink appending to the file at `path`, created if missing.
    pub fn file(path: impl Into<PathBuf>) -> Self {
        ResultSink {
            destination: Some(path.into()),
        }
    }

    pub fn destination(&self) -> Option<&Path> {
        self.destination.as_deref()
    }

    /// Write one line per sample.
    pub fn write(&self, samples: &[RawSample]) -> Result<(), Error> {
        match self.destination {
            None => {
                let stdout = io::stdout();
                let mut out = stdout.lock();
                write_records(&mut out, samples)
                    .and_then(|_| out.flush())
                    .map_err(|e| new_io_error("cannot write records to stdout", e))
            }
            Some(ref path) => {
                let context = || format!("cannot append records to {}", path.display());

                let file = OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(path)
                    .map_err(|e| new_io_error(context(), e))?;

                let mut out = BufWriter::new(file);
                write_records(&mut out, samples)
                    .and_then(|_| out.flush())
                    .map_err(|e| new_io_error(context(), e))
            }
        }
    }

    /// Read every record of a record file.
    pub fn read(path: impl AsRef<Path>) -> Result<Vec<RawSample>, Error> {
        let path = path.as_ref();
        let file = File::open(path)
            .map_err(|e| new_io_error(format!("cannot read {}", path.display()), e))?;
        read_records(BufReader::new(file))
    }
}

/// Write `samples` to `out` in the record format.
pub fn write_records<W: Write>(out: &mut W, samples: &[RawSample]) -> io::Result<()> {
    for sample in samples {
        writeln!(out, "{}", sample)?;
    }
    Ok(())
}

/// Parse records from `source`, skipping blank lines.
pub fn read_records<R: BufRead>(source: R) -> Result<Vec<RawSample>, Error> {
    let mut records = Vec::new();
    for (n, line) in source.lines().enumerate() {
        let line = line.map_err(|e| new_io_error("cannot read records", e))?;
        if line.trim().is_empty() {
            continue;
        }

        let record = line.parse().map_err(|e: Error| match e.into_kind() {
            ErrorKind::MalformedInput(why) => {
                new_error(ErrorKind::MalformedInput(format!("line {}: {}", n + 1, why)))
            }
            kind => new_error(kind),
        })?;
        records.push(record);
    }
    Ok(records)
}

/// Print `samples` as a boxed table, one block per CPU:
///
/// ```text
/// +-----+--------------+-----------+
/// | CPU | Event        | Value     |
/// +-----+--------------+-----------+
/// | 00  | instructions | 1,234,567 |
/// +-----+--------------+-----------+
/// ```
pub fn render_table<W: Write>(out: &mut W, samples: &[RawSample]) -> io::Result<()> {
    let mut blocks: Vec<(CpuId, Builder)> = Vec::new();
    for sample in samples {
        if blocks.last().map(|(cpu, _)| *cpu) != Some(sample.cpu) {
            let mut block = Builder::new();
            block.push_record(["CPU", "Event", "Value"]);
            blocks.push((sample.cpu, block));
        }

        let value = match sample.unit {
            Some(ref unit) => format!("{} {}", group_thousands(sample.value), unit),
            None => group_thousands(sample.value),
        };
        if let Some((_, block)) = blocks.last_mut() {
            block.push_record([format!("{:02}", sample.cpu), sample.event.clone(), value]);
        }
    }

    for (_, block) in blocks {
        let mut table = block.build();
        table.with(Style::ascii());
        writeln!(out, "{}", table)?;
    }
    Ok(())
}

/// Format `value` with `,` between groups of three digits.
pub fn group_thousands(value: i64) -> String {
    let digits = value.unsigned_abs().to_string();
    let mut grouped = String::with_capacity(digits.len() + digits.len() / 3 + 1);
    if value < 0 {
        grouped.push('-');
    }
    for (i, c) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            grouped.push(',');
        }
        grouped.push(c);
    }
    grouped
}

#[cfg(test)]
mod tests {
    use super::*;

    fn samples() -> Vec<RawSample> {
        vec![
            RawSample::new(0, 1000, None, "cycles"),
            RawSample::new(0, 2000, None, "instructions"),
            RawSample::new(1, 3, Some("ns".to_string()), "task-clock"),
        ]
    }

    #[test]
    fn test_write_records_format() {
        let mut buf = Vec::new();
        write_records(&mut buf, &samples()).unwrap();
        assert_eq!(
            String::from_utf8(buf).unwrap(),
            "0:1000::cycles\n0:2000::instructions\n1:3:ns:task-clock\n"
        );
    }

    #[test]
    fn test_file_sink_appends() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("results.txt");
        let sink = ResultSink::file(&path);

        sink.write(&samples()).unwrap();
        sink.write(&samples()[..1]).unwrap();

        let records = ResultSink::read(&path).unwrap();
        assert_eq!(records.len(), 4);
        assert_eq!(records[3], samples()[0]);
    }

    #[test]
    fn test_write_to_missing_directory_fails() {
        let dir = tempfile::tempdir().unwrap();
        let sink = ResultSink::file(dir.path().join("nope").join("results.txt"));

        let err = sink.write(&samples()).unwrap_err();
        assert!(matches!(err.kind(), ErrorKind::Io(_)));
    }

    #[test]
    fn test_read_records_reports_line() {
        let input = "0:1::cycles\n\n0:x::instructions\n";
        let err = read_records(input.as_bytes()).unwrap_err();
        match err.kind() {
            ErrorKind::MalformedInput(why) => assert!(why.starts_with("line 3:"), "{}", why),
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[test]
    fn test_group_thousands() {
        assert_eq!(group_thousands(0), "0");
        assert_eq!(group_thousands(999), "999");
        assert_eq!(group_thousands(1000), "1,000");
        assert_eq!(group_thousands(-1234567), "-1,234,567");
        assert_eq!(group_thousands(i64::MIN), "-9,223,372,036,854,775,808");
    }

    #[test]
    fn test_render_table() {
        let mut buf = Vec::new();
        render_table(&mut buf, &samples()).unwrap();
        let table = String::from_utf8(buf).unwrap();
        let lines: Vec<&str> = table.lines().collect();

        let cells = |line: &str| -> Vec<String> {
            line.trim_matches('|')
                .split('|')
                .map(|c| c.trim().to_string())
                .collect()
        };
        let rows: Vec<Vec<String>> = lines
            .iter()
            .filter(|l| l.starts_with('|'))
            .map(|l| cells(l))
            .collect();

        // A header per cpu block
        assert_eq!(
            rows,
            vec![
                vec!["CPU", "Event", "Value"],
                vec!["00", "cycles", "1,000"],
                vec!["00", "instructions", "2,000"],
                vec!["CPU", "Event", "Value"],
                vec!["01", "task-clock", "3 ns"],
            ]
        );
        assert!(lines.iter().all(|l| l.starts_with('+') || l.starts_with('|')));
    }
}
