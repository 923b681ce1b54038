//! A scriptable in-memory counter layer, so the session lifecycle can be
//! exercised without counter hardware or privileges.

#![allow(dead_code)]

use std::{
    collections::BTreeSet,
    sync::{Arc, Mutex, MutexGuard},
};

use pmc_session::{
    native::{NativeLayer, Reading},
    CpuId, Error, ErrorKind, EventCatalog,
};

#[derive(Debug, Default)]
pub struct Script {
    /// Reported by `logical_cpus`.
    pub logical_cpus: usize,

    /// Maximum events per group, unlimited if zero.
    pub slots: usize,

    /// Events that fail to configure, on every CPU.
    pub unsupported: Vec<String>,

    /// CPUs that fail to configure as if offline.
    pub offline: Vec<CpuId>,

    pub fail_start: Vec<CpuId>,
    pub fail_stop: Vec<CpuId>,

    // Observed calls
    pub configured: Vec<CpuId>,
    pub started: Vec<CpuId>,
    pub stopped: Vec<CpuId>,
    pub released: Vec<CpuId>,
    pub counting: BTreeSet<CpuId>,
}

#[derive(Debug, Clone, Default)]
pub struct FakeLayer {
    script: Arc<Mutex<Script>>,
}

#[derive(Debug)]
pub struct FakeGroup {
    cpu: CpuId,
    events: usize,
    runs: i64,
}

impl FakeLayer {
    pub fn with_cpus(logical_cpus: usize) -> Self {
        let layer = FakeLayer::default();
        layer.script().logical_cpus = logical_cpus;
        layer
    }

    pub fn script(&self) -> MutexGuard<'_, Script> {
        self.script.lock().unwrap()
    }

    /// The value counted for event `index` on `cpu` during run `run`.
    pub fn value(cpu: CpuId, index: usize, run: i64) -> i64 {
        i64::from(cpu) * 1000 + index as i64 * 10 + run
    }
}

impl NativeLayer for FakeLayer {
    type Handle = FakeGroup;

    fn configure(&self, catalog: &EventCatalog, cpu: CpuId) -> Result<FakeGroup, Error> {
        let mut script = self.script();
        if script.offline.contains(&cpu) {
            return Err(ErrorKind::InvalidCpu(cpu).into());
        }
        if let Some(event) = catalog.iter().find(|e| script.unsupported.contains(e)) {
            return Err(ErrorKind::HardwareUnsupportedEvent {
                event: event.clone(),
                cpu,
            }
            .into());
        }
        if script.slots > 0 && catalog.len() > script.slots {
            return Err(ErrorKind::ResourceExhausted {
                cpu,
                requested: catalog.len(),
            }
            .into());
        }

        script.configured.push(cpu);
        Ok(FakeGroup {
            cpu,
            events: catalog.len(),
            runs: 0,
        })
    }

    fn start(&self, handle: &mut FakeGroup) -> Result<(), Error> {
        let mut script = self.script();
        if script.fail_start.contains(&handle.cpu) {
            return Err(ErrorKind::Unknown.into());
        }
        assert!(
            script.counting.insert(handle.cpu),
            "cpu {} started twice",
            handle.cpu
        );
        script.started.push(handle.cpu);
        handle.runs += 1;
        Ok(())
    }

    fn stop(&self, handle: &mut FakeGroup) -> Result<Vec<Reading>, Error> {
        let mut script = self.script();
        script.counting.remove(&handle.cpu);
        if script.fail_stop.contains(&handle.cpu) {
            return Err(ErrorKind::Unknown.into());
        }
        script.stopped.push(handle.cpu);
        Ok((0..handle.events)
            .map(|i| Reading::count(Self::value(handle.cpu, i, handle.runs)))
            .collect())
    }

    fn release(&self, handle: FakeGroup) {
        let mut script = self.script();
        script.counting.remove(&handle.cpu);
        script.released.push(handle.cpu);
    }

    fn logical_cpus(&self) -> Result<usize, Error> {
        Ok(self.script().logical_cpus)
    }
}

pub fn catalog(events: &[&str]) -> EventCatalog {
    EventCatalog::new(events.iter().copied()).unwrap()
}
