//! Counter groups on FreeBSD, using [`libpmc`] and the [`hwpmc`] kernel
//! module.
//!
//! libpmc has no notion of a group: a [`PmcGroup`] is one system-scoped PMC
//! per event, all allocated on the same CPU and started and stopped together.
//!
//! [`hwpmc`]: https://www.freebsd.org/cgi/man.cgi?query=hwpmc
//! [`libpmc`]: https://www.freebsd.org/cgi/man.cgi?query=pmc

use std::{
    convert::TryFrom,
    ffi::CString,
    io,
    sync::{Mutex, Once},
};

use log::{debug, warn};
use pmc_sys::{
    pmc_allocate, pmc_id_t, pmc_init, pmc_mode_PMC_MODE_SC, pmc_read, pmc_release, pmc_rw,
    pmc_start, pmc_stop,
};

use super::{NativeLayer, Reading};
use crate::{
    catalog::EventCatalog,
    cpu::CpuId,
    error::{new_error, new_os_error, Error, ErrorKind},
};

static PMC_INIT: Once = Once::new();

lazy_static! {
    static ref BIG_FAT_LOCK: Mutex<u32> = Mutex::new(42);
}

/// The FreeBSD `hwpmc` counter layer.
#[derive(Debug, Clone, Copy, Default)]
pub struct Hwpmc;

/// System-scoped PMCs bound to one CPU, one per event.
#[derive(Debug)]
pub struct PmcGroup {
    cpu: CpuId,
    ids: Vec<pmc_id_t>,
}

impl Hwpmc {
    fn allocate(event: &str, cpu: CpuId, requested: usize) -> Result<pmc_id_t, Error> {
        let unsupported = || ErrorKind::HardwareUnsupportedEvent {
            event: event.to_string(),
            cpu,
        };
        let c_spec = CString::new(event).map_err(|_| new_error(unsupported()))?;

        let mut id = 0;
        if unsafe {
            pmc_allocate(
                c_spec.as_ptr(),
                pmc_mode_PMC_MODE_SC,
                0,
                cpu as i32,
                &mut id,
                0,
            )
        } != 0
        {
            return match io::Error::last_os_error().raw_os_error() {
                Some(libc::EINVAL) => Err(new_os_error(unsupported())),
                Some(libc::EBUSY) | Some(libc::ENOSPC) | Some(libc::EAGAIN) => {
                    Err(new_os_error(ErrorKind::ResourceExhausted { cpu, requested }))
                }
                Some(libc::ENXIO) => Err(new_os_error(ErrorKind::InvalidCpu(cpu))),
                Some(libc::EPERM) => Err(new_os_error(ErrorKind::Forbidden)),
                _ => Err(new_os_error(ErrorKind::Unknown)),
            };
        }

        Ok(id)
    }
}

impl NativeLayer for Hwpmc {
    type Handle = PmcGroup;

    fn configure(&self, catalog: &EventCatalog, cpu: CpuId) -> Result<PmcGroup, Error> {
        // It appears pmc_allocate isn't thread safe, so take a lock while
        // calling it.
        let _guard = BIG_FAT_LOCK
            .lock()
            .map_err(|_| new_error(ErrorKind::Unknown))?;

        init_pmc_once()?;

        let mut group = PmcGroup {
            cpu,
            ids: Vec::with_capacity(catalog.len()),
        };
        for event in catalog.iter() {
            match Self::allocate(event, cpu, catalog.len()) {
                Ok(id) => group.ids.push(id),
                Err(e) => {
                    release_ids(&group.ids);
                    return Err(e);
                }
            }
        }

        debug!("allocated {} PMCs on cpu {}", group.ids.len(), cpu);
        Ok(group)
    }

    fn start(&self, handle: &mut PmcGroup) -> Result<(), Error> {
        for (i, &id) in handle.ids.iter().enumerate() {
            if unsafe { pmc_start(id) } != 0 {
                let err = match io::Error::last_os_error().raw_os_error() {
                    Some(libc::ENXIO) => new_os_error(ErrorKind::Forbidden),
                    _ => new_os_error(ErrorKind::Unknown),
                };
                // Leave the group all stopped
                for &started in &handle.ids[..i] {
                    unsafe { pmc_stop(started) };
                }
                return Err(err);
            }
        }
        Ok(())
    }

    fn stop(&self, handle: &mut PmcGroup) -> Result<Vec<Reading>, Error> {
        for &id in &handle.ids {
            unsafe { pmc_stop(id) };
        }

        let mut readings = Vec::with_capacity(handle.ids.len());
        for &id in &handle.ids {
            // Swap in zero, reading the counted value out
            let mut value: u64 = 0;
            if unsafe { pmc_rw(id, 0, &mut value) } != 0 {
                if unsafe { pmc_read(id, &mut value) } != 0 {
                    return Err(new_os_error(ErrorKind::Unknown));
                }
                warn!("cannot reset PMC {} on cpu {}", id, handle.cpu);
            }
            readings.push(Reading::count(i64::try_from(value).unwrap_or(i64::MAX)));
        }

        Ok(readings)
    }

    fn release(&self, handle: PmcGroup) {
        let _guard = BIG_FAT_LOCK.lock();
        release_ids(&handle.ids);
        debug!("released {} PMCs on cpu {}", handle.ids.len(), handle.cpu);
    }
}

fn release_ids(ids: &[pmc_id_t]) {
    for &id in ids {
        unsafe {
            pmc_release(id);
        }
    }
}

fn init_pmc_once() -> Result<(), Error> {
    let mut maybe_err = Ok(());
    PMC_INIT.call_once(|| {
        if unsafe { pmc_init() } != 0 {
            maybe_err = match io::Error::last_os_error().raw_os_error() {
                Some(libc::ENOENT) | Some(libc::ENXIO) => Err(new_os_error(ErrorKind::Unsupported)),
                _ => Err(new_os_error(ErrorKind::Unknown)),
            };
        }
    });
    maybe_err
}
