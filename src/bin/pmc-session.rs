//! # pmc-session
//!
//! - `pmc-session record -e cycles,instructions -c 0-3 -n 5 -o out.txt -- ./bench`
//!   runs `./bench` five times, counting the events on CPUs 0 to 3 around
//!   each run and appending the records to `out.txt`.
//! - `pmc-session report out.txt` pivots a record file into one row per
//!   iteration and CPU, with derived rates and event totals.

use std::{
    io::{self, Write},
    path::PathBuf,
    process::Command,
};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use log::{info, warn};
use pmc_session::{
    native::Platform, sink, CpuSet, DerivedMetric, Error, ErrorKind, EventCatalog,
    MeasurementSession, ResultSink, ResultTable, FP_OPERATION_WEIGHTS,
};

// Exit codes
const EXIT_SUCCESS: i32 = 0;
const EXIT_ERROR: i32 = 1;
const EXIT_NOPERM: i32 = 77;

#[derive(Parser)]
#[command(version, about = "Count hardware events per CPU around a command")]
struct Args {
    #[command(subcommand)]
    command: Cmd,
}

#[derive(Subcommand)]
enum Cmd {
    /// Run a command while counting events, appending the counts to a record
    /// file.
    Record(RecordArgs),

    /// Summarise a record file.
    Report(ReportArgs),
}

#[derive(clap::Args)]
struct RecordArgs {
    #[arg(
        short,
        long,
        value_delimiter = ',',
        conflicts_with = "events_file",
        help = "Comma separated events to count"
    )]
    events: Vec<String>,

    #[arg(long, value_name = "FILE", help = "File listing one event per line")]
    events_file: Option<PathBuf>,

    #[arg(short, long, default_value = "all", help = "CPUs to count on, e.g. 0,2,4-7")]
    cpus: CpuSet,

    #[arg(short = 'n', long, default_value = "1", help = "Number of times to run the command")]
    iterations: u32,

    #[arg(short, long, help = "Append records to this file instead of stdout")]
    output: Option<PathBuf>,

    #[arg(
        long,
        conflicts_with = "output",
        help = "Print a table of each iteration instead of raw records"
    )]
    table: bool,

    #[arg(long, help = "Do not count kernel mode events")]
    exclude_kernel: bool,

    #[arg(trailing_var_arg = true, required = true, help = "Command to measure")]
    command: Vec<String>,
}

#[derive(clap::Args)]
struct ReportArgs {
    #[arg(help = "Record file written by `record`")]
    input: PathBuf,

    #[arg(long, help = "Print the records per CPU without pivoting")]
    raw: bool,
}

fn main() {
    env_logger::init();
    std::process::exit(match run(Args::parse()) {
        Ok(()) => EXIT_SUCCESS,
        Err(e) => {
            let code = exit_code_for(&e);
            eprintln!("error: {:#}", e);
            code
        }
    });
}

fn exit_code_for(err: &anyhow::Error) -> i32 {
    let forbidden = err
        .chain()
        .filter_map(|e| e.downcast_ref::<Error>())
        .any(|e| e.kind() == &ErrorKind::Forbidden);
    if forbidden {
        EXIT_NOPERM
    } else {
        EXIT_ERROR
    }
}

fn run(args: Args) -> Result<()> {
    match args.command {
        Cmd::Record(args) => record(args),
        Cmd::Report(args) => report(args),
    }
}

#[cfg(target_os = "linux")]
fn platform(args: &RecordArgs) -> Platform {
    pmc_session::native::PerfConfig::default()
        .exclude_kernel(args.exclude_kernel)
        .build()
}

#[cfg(not(target_os = "linux"))]
fn platform(args: &RecordArgs) -> Platform {
    if args.exclude_kernel {
        warn!("--exclude-kernel is only supported on linux");
    }
    Platform::default()
}

fn record(args: RecordArgs) -> Result<()> {
    let catalog = match args.events_file {
        Some(ref path) => EventCatalog::load(path)
            .with_context(|| format!("Failed to load events from {}", path.display()))?,
        None => EventCatalog::new(args.events.iter().map(|e| e.trim()))
            .context("No events to count, use --events or --events-file")?,
    };
    let sink = ResultSink::new(args.output.clone());

    let mut session = MeasurementSession::new(platform(&args));
    session
        .prepare(catalog, &args.cpus)
        .with_context(|| format!("Failed to configure counters on cpus {}", args.cpus))?;

    let result = record_iterations(&mut session, &args, &sink);
    session.finalize();
    result
}

fn record_iterations(
    session: &mut MeasurementSession<Platform>,
    args: &RecordArgs,
    sink: &ResultSink,
) -> Result<()> {
    let (program, program_args) = args
        .command
        .split_first()
        .context("Missing command to measure")?;

    for iteration in 0..args.iterations {
        let (status, samples) =
            session.measure(|| Command::new(program).args(program_args).status())?;

        let status = status.with_context(|| format!("Failed to run {}", program))?;
        if !status.success() {
            warn!("iteration {}: {} exited with {}", iteration, program, status);
        }
        if !session.last_stop_failures().is_empty() {
            warn!(
                "iteration {}: no counts from cpus {:?}",
                iteration,
                session.last_stop_failures()
            );
        }

        if args.table {
            let stdout = io::stdout();
            sink::render_table(&mut stdout.lock(), &samples)?;
        } else {
            session.emit(&samples, sink)?;
        }
        info!("iteration {}: {} samples", iteration, samples.len());
    }

    Ok(())
}

fn report(args: ReportArgs) -> Result<()> {
    let records = ResultSink::read(&args.input)
        .with_context(|| format!("Failed to read records from {}", args.input.display()))?;

    let stdout = io::stdout();
    let mut out = stdout.lock();

    if args.raw {
        sink::render_table(&mut out, &records)?;
        return Ok(());
    }

    let table = ResultTable::from_records(&records)
        .with_context(|| format!("{} is not a complete record file", args.input.display()))?
        .with_rates(&DerivedMetric::defaults())?;

    write!(out, "{}", table)?;

    writeln!(out)?;
    writeln!(
        out,
        "{} iterations on cpus {:?}",
        table.iterations(),
        table.cpus()
    )?;
    for (event, total) in table.event_totals() {
        writeln!(out, "{:>40}  {}", event, sink::group_thousands(total as i64))?;
    }
    if let Some(flops) = table.weighted_total(FP_OPERATION_WEIGHTS) {
        writeln!(
            out,
            "{:>40}  {}",
            "floating point operations",
            sink::group_thousands(flops as i64)
        )?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use clap::{error::ErrorKind as ClapErrorKind, CommandFactory};

    use super::*;

    #[test]
    fn test_args() {
        Args::command().debug_assert();
    }

    #[test]
    fn test_table_conflicts_with_output() {
        let err = Args::try_parse_from([
            "pmc-session", "record", "-e", "cycles", "--table", "-o", "out.txt", "--", "true",
        ])
        .err()
        .unwrap();
        assert_eq!(err.kind(), ClapErrorKind::ArgumentConflict);

        let args = Args::try_parse_from([
            "pmc-session", "record", "-e", "cycles", "--table", "--", "true",
        ])
        .unwrap();
        match args.command {
            Cmd::Record(record) => {
                assert!(record.table);
                assert!(record.output.is_none());
            }
            Cmd::Report(_) => panic!("expected record"),
        }
    }
}
