//! `pmc-session` measures hardware performance counters on a set of CPUs
//! around a region of interest, and reduces the recorded counts into derived
//! rates such as instructions per cycle.
//!
//! A [`MeasurementSession`] binds one counter group per CPU
//! ([`CounterBinding`]) counting every event of an [`EventCatalog`], and walks
//! them through a guarded `prepare`, `start`, `stop`, `finalize` lifecycle.
//! Each `stop` returns one [`RawSample`] per CPU and event, which a
//! [`ResultSink`] appends to a record file (or prints).
//!
//! Record files are consumed offline: [`ResultTable`] pivots them into
//! iterations and appends [`DerivedMetric`] columns computed by [`rate`].
//!
//! Counters are read system-wide on each CPU through [`perf_event_open`] on
//! Linux and [`libpmc`] (with the [`hwpmc`] kernel module) on [`FreeBSD`].
//! Both require elevated privileges; other platforms fail with
//! [`ErrorKind::Unsupported`].
//!
//! ```no_run
//! use pmc_session::{
//!     native::Platform, CpuSet, DerivedMetric, EventCatalog, MeasurementSession, ResultSink,
//!     ResultTable,
//! };
//!
//! let catalog = EventCatalog::new(vec!["cycles", "instructions"])?;
//! let sink = ResultSink::file("results.txt");
//!
//! let mut session = MeasurementSession::new(Platform::default());
//! session.prepare(catalog, &CpuSet::All)?;
//! for _ in 0..3 {
//!     let (_, samples) = session.measure(|| {
//!         // do some stuff...
//!     })?;
//!     session.emit(&samples, &sink)?;
//! }
//! session.finalize();
//!
//! let table = ResultTable::from_records(&ResultSink::read("results.txt")?)?
//!     .with_rates(&[DerivedMetric::ipc()])?;
//! print!("{}", table);
//! #
//! # Ok::<(), pmc_session::Error>(())
//! ```
//!
//! [`perf_event_open`]: https://man7.org/linux/man-pages/man2/perf_event_open.2.html
//! [`FreeBSD`]: https://www.freebsd.org/
//! [`hwpmc`]: https://www.freebsd.org/cgi/man.cgi?query=hwpmc
//! [`libpmc`]: https://www.freebsd.org/cgi/man.cgi?query=pmc

#[macro_use]
extern crate lazy_static;

pub mod error;
pub use self::error::{ConfigurationError, Error, ErrorKind, LifecycleError};

mod catalog;
pub use self::catalog::{EventCatalog, EventName};

mod cpu;
pub use self::cpu::{logical_cpus, CpuId, CpuSet};

pub mod native;

mod sample;
pub use self::sample::RawSample;

mod binding;
pub use self::binding::CounterBinding;

mod session;
pub use self::session::{MeasurementSession, Operation, SessionState};

pub mod sink;
pub use self::sink::ResultSink;

mod rate;
pub use self::rate::rate;

mod table;
pub use self::table::{DerivedMetric, ResultTable, Row, TableRow, FP_OPERATION_WEIGHTS};
