use std::fmt;

use log::{debug, info, warn};

use crate::{
    binding::CounterBinding,
    catalog::EventCatalog,
    cpu::{CpuId, CpuSet},
    error::{ConfigurationError, Error, ErrorKind, LifecycleError},
    native::NativeLayer,
    sample::RawSample,
    sink::ResultSink,
};

/// The lifecycle state of a [`MeasurementSession`].
///
/// ```text
/// Idle --prepare--> Prepared --start--> Counting --stop--> Stopped
///                      |                   ^                  |
///                      |                   +------start-------+
///                      +--finalize--> Finalized <--finalize---+
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    Idle,
    Prepared,
    Counting,
    Stopped,
    Finalized,
}

/// A lifecycle operation of a [`MeasurementSession`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Prepare,
    Start,
    Stop,
    Finalize,
}

impl SessionState {
    /// The state reached by applying `op`, or `None` if `op` is not valid in
    /// this state.
    pub fn transition(self, op: Operation) -> Option<SessionState> {
        use Operation::*;
        use SessionState::*;

        match (self, op) {
            (Idle, Prepare) => Some(Prepared),
            (Prepared, Start) | (Stopped, Start) => Some(Counting),
            (Counting, Stop) => Some(Stopped),
            (Prepared, Finalize) | (Stopped, Finalize) => Some(Finalized),
            _ => None,
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SessionState::Idle => "idle",
            SessionState::Prepared => "prepared",
            SessionState::Counting => "counting",
            SessionState::Stopped => "stopped",
            SessionState::Finalized => "finalized",
        };
        f.write_str(s)
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Operation::Prepare => "prepare",
            Operation::Start => "start",
            Operation::Stop => "stop",
            Operation::Finalize => "finalize",
        };
        f.write_str(s)
    }
}

/// Counts one [`EventCatalog`] on a set of CPUs, one [`CounterBinding`] per
/// CPU.
///
/// The session is the only owner of its bindings and walks them through a
/// guarded lifecycle (see [`SessionState`]). Any operation that is not valid
/// in the current state fails with [`LifecycleError::InvalidTransition`] and
/// leaves the session untouched.
///
/// Bindings are always driven, and samples always returned, in ascending CPU
/// order.
///
/// ```no_run
/// use pmc_session::{native::Platform, CpuSet, EventCatalog, MeasurementSession, ResultSink};
///
/// let mut session = MeasurementSession::new(Platform::default());
/// session.prepare(EventCatalog::load("conf/events.cfg")?, &CpuSet::All)?;
///
/// let sink = ResultSink::file("out/results.txt");
/// for epoch in 0..10 {
///     session.start()?;
///     // train one epoch...
///     let samples = session.stop()?;
///     session.emit(&samples, &sink)?;
/// }
///
/// session.finalize();
/// #
/// # Ok::<(), pmc_session::Error>(())
/// ```
#[derive(Debug)]
pub struct MeasurementSession<L: NativeLayer> {
    layer: L,
    state: SessionState,
    catalog: Option<EventCatalog>,
    bindings: Vec<CounterBinding<L>>,
    failed_stops: Vec<CpuId>,
}

impl<L: NativeLayer> MeasurementSession<L> {
    /// Create an idle session on top of `layer`.
    pub fn new(layer: L) -> Self {
        MeasurementSession {
            layer,
            state: SessionState::Idle,
            catalog: None,
            bindings: Vec::new(),
            failed_stops: Vec::new(),
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// The events being counted, once prepared.
    pub fn catalog(&self) -> Option<&EventCatalog> {
        self.catalog.as_ref()
    }

    /// The CPUs counters are bound to, in ascending order.
    pub fn cpus(&self) -> Vec<CpuId> {
        self.bindings.iter().map(CounterBinding::cpu).collect()
    }

    pub fn bindings(&self) -> &[CounterBinding<L>] {
        &self.bindings
    }

    /// The CPUs whose counters could not be read by the last [`stop`].
    ///
    /// [`stop`]: MeasurementSession::stop
    pub fn last_stop_failures(&self) -> &[CpuId] {
        &self.failed_stops
    }

    fn check(&self, attempted: Operation) -> Result<SessionState, Error> {
        self.state.transition(attempted).ok_or_else(|| {
            LifecycleError::InvalidTransition {
                from: self.state,
                attempted,
            }
            .into()
        })
    }

    /// Bind one counter group for `catalog` to every CPU of `cpus`.
    ///
    /// [`CpuSet::All`] is resolved here, once, to every logical CPU of the
    /// host. If any CPU fails to configure, the groups already configured by
    /// this call are released before the error is returned and the session
    /// stays idle.
    pub fn prepare(&mut self, catalog: EventCatalog, cpus: &CpuSet) -> Result<(), Error> {
        let next = self.check(Operation::Prepare)?;

        let logical_cpus = match cpus {
            CpuSet::All => self.layer.logical_cpus()?,
            CpuSet::Only(_) => 0,
        };
        let cpus = cpus.resolve(logical_cpus);
        if cpus.is_empty() {
            return Err(ConfigurationError::NoCpus.into());
        }

        let mut bindings = Vec::with_capacity(cpus.len());
        for cpu in cpus {
            match CounterBinding::configure(&self.layer, &catalog, cpu) {
                Ok(binding) => bindings.push(binding),
                Err(e) => {
                    warn!(
                        "failed to configure counters on cpu {}, releasing {} configured cpus: {}",
                        cpu,
                        bindings.len(),
                        e
                    );
                    for binding in &mut bindings {
                        binding.release();
                    }
                    return Err(e);
                }
            }
        }

        info!(
            "prepared {} events on {} cpus: {}",
            catalog.len(),
            bindings.len(),
            catalog
        );
        self.bindings = bindings;
        self.catalog = Some(catalog);
        self.state = next;
        Ok(())
    }

    /// Start counting on every CPU.
    ///
    /// A CPU that fails to start does not stop the others: every binding is
    /// attempted, and the failed CPUs are reported together as
    /// [`LifecycleError::PartialStart`]. The CPUs that did start keep
    /// counting (and the session is `Counting`) until [`stop`] or
    /// [`finalize`].
    ///
    /// [`stop`]: MeasurementSession::stop
    /// [`finalize`]: MeasurementSession::finalize
    pub fn start(&mut self) -> Result<(), Error> {
        let next = self.check(Operation::Start)?;

        let mut failed = Vec::new();
        for binding in &mut self.bindings {
            if let Err(e) = binding.start() {
                warn!("failed to start counters on cpu {}: {}", binding.cpu(), e);
                failed.push(binding.cpu());
            }
        }

        if failed.len() < self.bindings.len() {
            self.state = next;
        }
        debug!("session {}", self.state);

        if failed.is_empty() {
            Ok(())
        } else {
            Err(LifecycleError::PartialStart(failed).into())
        }
    }

    /// Stop counting and collect one sample per CPU and event, in ascending
    /// CPU order then catalog order.
    ///
    /// A CPU whose counters cannot be read is left out of the result and
    /// listed by [`last_stop_failures`]; the session is `Stopped` either
    /// way.
    ///
    /// [`last_stop_failures`]: MeasurementSession::last_stop_failures
    pub fn stop(&mut self) -> Result<Vec<RawSample>, Error> {
        let next = self.check(Operation::Stop)?;

        let events = self.catalog.as_ref().map_or(0, |c| c.len());
        let mut samples = Vec::with_capacity(events * self.bindings.len());
        self.failed_stops.clear();

        for binding in &mut self.bindings {
            match binding.stop() {
                Ok(s) => samples.extend(s),
                Err(e) => {
                    warn!("failed to read counters on cpu {}: {}", binding.cpu(), e);
                    self.failed_stops.push(binding.cpu());
                }
            }
        }

        self.state = next;
        debug!("session {}, {} samples", self.state, samples.len());
        Ok(samples)
    }

    /// Run `region` between a [`start`] and a [`stop`], returning its result
    /// and the samples.
    ///
    /// If only some CPUs failed to start, `region` still runs and the samples
    /// of the CPUs that did start are returned. The failed CPUs are reported
    /// by [`last_stop_failures`].
    ///
    /// [`start`]: MeasurementSession::start
    /// [`stop`]: MeasurementSession::stop
    /// [`last_stop_failures`]: MeasurementSession::last_stop_failures
    pub fn measure<F, R>(&mut self, region: F) -> Result<(R, Vec<RawSample>), Error>
    where
        F: FnOnce() -> R,
    {
        if let Err(e) = self.start() {
            match e.kind() {
                ErrorKind::Lifecycle(LifecycleError::PartialStart(failed))
                    if self.state == SessionState::Counting =>
                {
                    warn!("measuring without cpus {:?}", failed);
                }
                _ => return Err(e),
            }
        }

        let ret = region();
        let samples = self.stop()?;
        Ok((ret, samples))
    }

    /// Write `samples` to `sink`. The session state is not affected.
    pub fn emit(&self, samples: &[RawSample], sink: &ResultSink) -> Result<(), Error> {
        sink.write(samples)
    }

    /// Release every counter group and end the session.
    ///
    /// `finalize` always succeeds, whatever state the session is in, so it is
    /// safe to call while unwinding from any other error. Counters still
    /// counting are released without being read. Finalizing a finalized
    /// session does nothing.
    pub fn finalize(&mut self) {
        match self.state {
            SessionState::Finalized => return,
            SessionState::Counting => {
                warn!("finalizing a session that is still counting, discarding counts")
            }
            _ => {}
        }

        for binding in &mut self.bindings {
            binding.release();
        }
        info!("finalized session on {} cpus", self.bindings.len());

        self.bindings.clear();
        self.state = SessionState::Finalized;
    }
}

#[cfg(test)]
mod tests {
    use super::Operation::*;
    use super::SessionState::*;

    #[test]
    fn test_transitions() {
        assert_eq!(Idle.transition(Prepare), Some(Prepared));
        assert_eq!(Prepared.transition(Start), Some(Counting));
        assert_eq!(Counting.transition(Stop), Some(Stopped));
        assert_eq!(Stopped.transition(Start), Some(Counting));
        assert_eq!(Stopped.transition(Finalize), Some(Finalized));
        assert_eq!(Prepared.transition(Finalize), Some(Finalized));
    }

    #[test]
    fn test_invalid_transitions() {
        let states = [Idle, Prepared, Counting, Stopped, Finalized];
        let ops = [Prepare, Start, Stop, Finalize];

        let valid = [
            (Idle, Prepare),
            (Prepared, Start),
            (Stopped, Start),
            (Counting, Stop),
            (Prepared, Finalize),
            (Stopped, Finalize),
        ];

        for &state in &states {
            for &op in &ops {
                assert_eq!(
                    state.transition(op).is_some(),
                    valid.contains(&(state, op)),
                    "{} from {}",
                    op,
                    state
                );
            }
        }
    }
}
