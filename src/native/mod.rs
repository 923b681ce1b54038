//! The native counter layer a [`CounterBinding`] is built on.
//!
//! A [`NativeLayer`] exposes four primitive operations on a group of events
//! bound to one CPU: configure, start, stop (read and reset) and release.
//! [`Platform`] is the implementation for the current target OS:
//!
//! * Linux: [`perf_event_open`] counter groups.
//! * FreeBSD: [`libpmc`] system-scoped PMCs.
//! * Anything else: every operation fails with [`ErrorKind::Unsupported`].
//!
//! [`CounterBinding`]: crate::CounterBinding
//! [`ErrorKind::Unsupported`]: crate::ErrorKind::Unsupported
//! [`perf_event_open`]: https://man7.org/linux/man-pages/man2/perf_event_open.2.html
//! [`libpmc`]: https://www.freebsd.org/cgi/man.cgi?query=pmc

use std::fmt;

use crate::{catalog::EventCatalog, cpu::CpuId, error::Error};

#[cfg(target_os = "linux")]
mod linux;
#[cfg(target_os = "linux")]
pub use self::linux::{PerfConfig, PerfEvents as Platform, PerfGroup};

#[cfg(target_os = "freebsd")]
mod freebsd;
#[cfg(target_os = "freebsd")]
pub use self::freebsd::{Hwpmc as Platform, PmcGroup};

#[cfg(not(any(target_os = "linux", target_os = "freebsd")))]
mod stubs;
#[cfg(not(any(target_os = "linux", target_os = "freebsd")))]
pub use self::stubs::Unsupported as Platform;

/// One counter value read from the native layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reading {
    /// The number of events counted since the last reset.
    pub value: i64,

    /// The unit of `value`, if it is not a plain event count.
    pub unit: Option<String>,
}

impl Reading {
    /// A plain event count.
    pub fn count(value: i64) -> Self {
        Reading { value, unit: None }
    }
}

/// Access to per-CPU counter hardware.
///
/// Implementations are cheap to clone: every [`CounterBinding`] of a session
/// holds its own copy.
///
/// Two sessions must not bind the same event on the same CPU concurrently.
/// Implementations may reject such a conflict when configuring, but nothing
/// above this layer detects it.
///
/// [`CounterBinding`]: crate::CounterBinding
pub trait NativeLayer: Clone {
    /// An allocated, configured counter group.
    type Handle: fmt::Debug;

    /// Allocate a counter group counting every event in `catalog` on `cpu`.
    ///
    /// The group is created stopped, with every counter at zero.
    fn configure(&self, catalog: &EventCatalog, cpu: CpuId) -> Result<Self::Handle, Error>;

    /// Begin counting.
    fn start(&self, handle: &mut Self::Handle) -> Result<(), Error>;

    /// Stop counting, read every counter and reset them to zero.
    ///
    /// Returns exactly one reading per configured event, in catalog order.
    fn stop(&self, handle: &mut Self::Handle) -> Result<Vec<Reading>, Error>;

    /// Free the counter group.
    fn release(&self, handle: Self::Handle);

    /// The number of logical CPUs of the host, used to resolve
    /// [`CpuSet::All`].
    ///
    /// [`CpuSet::All`]: crate::CpuSet::All
    fn logical_cpus(&self) -> Result<usize, Error> {
        crate::cpu::logical_cpus()
    }
}
