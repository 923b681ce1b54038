use super::{NativeLayer, Reading};
use crate::{
    catalog::EventCatalog,
    cpu::CpuId,
    error::{new_error, Error, ErrorKind},
};

/// Counter access on platforms without a supported counter interface.
///
/// Every operation fails with [`ErrorKind::Unsupported`].
#[derive(Debug, Clone, Copy, Default)]
pub struct Unsupported;

impl NativeLayer for Unsupported {
    type Handle = ();

    fn configure(&self, _catalog: &EventCatalog, _cpu: CpuId) -> Result<(), Error> {
        Err(new_error(ErrorKind::Unsupported))
    }

    fn start(&self, _handle: &mut ()) -> Result<(), Error> {
        Err(new_error(ErrorKind::Unsupported))
    }

    fn stop(&self, _handle: &mut ()) -> Result<Vec<Reading>, Error> {
        Err(new_error(ErrorKind::Unsupported))
    }

    fn release(&self, _handle: ()) {}
}
