use std::{collections::BTreeSet, fmt, str::FromStr};

use crate::error::{new_error, Error, ErrorKind};

/// A logical CPU number.
pub type CpuId = u32;

/// The CPUs a [`MeasurementSession`] binds counters to.
///
/// [`MeasurementSession`]: crate::MeasurementSession
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CpuSet {
    /// Every logical CPU of the host, resolved when the session is prepared.
    All,

    /// An explicit set of CPUs.
    Only(BTreeSet<CpuId>),
}

impl CpuSet {
    /// Resolve the set into ascending CPU numbers, using `logical_cpus` for
    /// [`CpuSet::All`].
    pub fn resolve(&self, logical_cpus: usize) -> Vec<CpuId> {
        match self {
            CpuSet::All => (0..logical_cpus as CpuId).collect(),
            CpuSet::Only(cpus) => cpus.iter().copied().collect(),
        }
    }
}

impl Default for CpuSet {
    fn default() -> Self {
        CpuSet::All
    }
}

impl From<Vec<CpuId>> for CpuSet {
    fn from(cpus: Vec<CpuId>) -> Self {
        CpuSet::Only(cpus.into_iter().collect())
    }
}

impl From<BTreeSet<CpuId>> for CpuSet {
    fn from(cpus: BTreeSet<CpuId>) -> Self {
        CpuSet::Only(cpus)
    }
}

/// Parses `all`, or a comma separated list of CPUs and inclusive ranges such
/// as `0,2,4-7`.
impl FromStr for CpuSet {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Error> {
        let s = s.trim();
        if s.eq_ignore_ascii_case("all") {
            return Ok(CpuSet::All);
        }

        let bad = || new_error(ErrorKind::MalformedInput(format!("invalid cpu list {:?}", s)));
        let parse = |v: &str| v.trim().parse::<CpuId>().map_err(|_| bad());

        let mut cpus = BTreeSet::new();
        for part in s.split(',') {
            match part.split_once('-') {
                Some((lo, hi)) => {
                    let (lo, hi) = (parse(lo)?, parse(hi)?);
                    if lo > hi {
                        return Err(bad());
                    }
                    cpus.extend(lo..=hi);
                }
                None => {
                    cpus.insert(parse(part)?);
                }
            }
        }

        Ok(CpuSet::Only(cpus))
    }
}

impl fmt::Display for CpuSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CpuSet::All => write!(f, "all"),
            CpuSet::Only(cpus) => {
                let list: Vec<String> = cpus.iter().map(|c| c.to_string()).collect();
                write!(f, "{}", list.join(","))
            }
        }
    }
}

/// Number of online logical CPUs on this host.
#[cfg(unix)]
pub fn logical_cpus() -> Result<usize, Error> {
    let n = unsafe { libc::sysconf(libc::_SC_NPROCESSORS_ONLN) };
    if n < 1 {
        return Err(crate::error::new_os_error(ErrorKind::Unknown));
    }
    Ok(n as usize)
}

/// Number of logical CPUs available to this process.
#[cfg(not(unix))]
pub fn logical_cpus() -> Result<usize, Error> {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .map_err(|_| new_error(ErrorKind::Unknown))
}
