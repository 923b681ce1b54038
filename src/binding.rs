use log::debug;

use crate::{
    catalog::EventCatalog,
    cpu::CpuId,
    error::{new_error, Error, ErrorKind, LifecycleError},
    native::NativeLayer,
    sample::RawSample,
};

/// A group of counters bound to one CPU.
///
/// A binding owns exactly one native counter group. It is created stopped
/// by [`configure`], alternates between counting and stopped through
/// [`start`] and [`stop`], and frees the group on [`release`] or when
/// dropped.
///
/// ```no_run
/// use pmc_session::{native::Platform, CounterBinding, EventCatalog};
///
/// let catalog = EventCatalog::new(vec!["cycles", "instructions"])?;
/// let mut binding = CounterBinding::configure(&Platform::default(), &catalog, 0)?;
///
/// binding.start()?;
/// // Do some stuff...
/// for sample in binding.stop()? {
///     println!("{}", sample);
/// }
///
/// binding.release();
/// #
/// # Ok::<(), pmc_session::Error>(())
/// ```
///
/// [`configure`]: CounterBinding::configure
/// [`start`]: CounterBinding::start
/// [`stop`]: CounterBinding::stop
/// [`release`]: CounterBinding::release
#[derive(Debug)]
pub struct CounterBinding<L: NativeLayer> {
    layer: L,
    cpu: CpuId,
    catalog: EventCatalog,
    handle: Option<L::Handle>,
    counting: bool,
}

impl<L: NativeLayer> CounterBinding<L> {
    /// Allocate one counter group on `cpu` counting every event of
    /// `catalog`.
    ///
    /// Fails with [`HardwareUnsupportedEvent`] naming the first event the CPU
    /// cannot count, or [`ResourceExhausted`] if the catalog needs more
    /// counters than the CPU has.
    ///
    /// [`HardwareUnsupportedEvent`]: crate::ErrorKind::HardwareUnsupportedEvent
    /// [`ResourceExhausted`]: crate::ErrorKind::ResourceExhausted
    pub fn configure(layer: &L, catalog: &EventCatalog, cpu: CpuId) -> Result<Self, Error> {
        let handle = layer.configure(catalog, cpu)?;
        debug!("configured {} events on cpu {}", catalog.len(), cpu);

        Ok(CounterBinding {
            layer: layer.clone(),
            cpu,
            catalog: catalog.clone(),
            handle: Some(handle),
            counting: false,
        })
    }

    /// Begin counting.
    ///
    /// Starting a binding that is already counting fails with
    /// [`LifecycleError::AlreadyCounting`] and leaves the counters running
    /// untouched.
    pub fn start(&mut self) -> Result<(), Error> {
        if self.counting {
            return Err(LifecycleError::AlreadyCounting(self.cpu).into());
        }
        let handle = self
            .handle
            .as_mut()
            .ok_or(LifecycleError::Released(self.cpu))?;

        self.layer.start(handle)?;
        self.counting = true;
        debug!("started counters on cpu {}", self.cpu);
        Ok(())
    }

    /// Stop counting, returning one sample per event in catalog order.
    ///
    /// The counters are reset to zero, so the next [`start`] counts from
    /// scratch.
    ///
    /// [`start`]: CounterBinding::start
    pub fn stop(&mut self) -> Result<Vec<RawSample>, Error> {
        if !self.counting {
            return Err(LifecycleError::NotCounting(self.cpu).into());
        }
        let handle = self
            .handle
            .as_mut()
            .ok_or(LifecycleError::Released(self.cpu))?;

        // Whatever the outcome the native layer has been asked to stop, and
        // the binding can be started again.
        self.counting = false;
        let readings = self.layer.stop(handle)?;

        if readings.len() != self.catalog.len() {
            return Err(new_error(ErrorKind::MalformedInput(format!(
                "cpu {} returned {} values for {} events",
                self.cpu,
                readings.len(),
                self.catalog.len()
            ))));
        }

        debug!("stopped counters on cpu {}", self.cpu);
        Ok(readings
            .into_iter()
            .zip(self.catalog.iter())
            .map(|(r, event)| RawSample::new(self.cpu, r.value, r.unit, event.as_str()))
            .collect())
    }

    /// Free the counter group.
    ///
    /// Releasing an already released binding does nothing.
    pub fn release(&mut self) {
        if let Some(handle) = self.handle.take() {
            self.layer.release(handle);
            self.counting = false;
            debug!("released counters on cpu {}", self.cpu);
        }
    }

    /// The CPU this binding counts on.
    pub fn cpu(&self) -> CpuId {
        self.cpu
    }

    /// The events this binding counts.
    pub fn catalog(&self) -> &EventCatalog {
        &self.catalog
    }

    pub fn is_counting(&self) -> bool {
        self.counting
    }

    pub fn is_released(&self) -> bool {
        self.handle.is_none()
    }
}

impl<L: NativeLayer> Drop for CounterBinding<L> {
    fn drop(&mut self) {
        self.release();
    }
}
