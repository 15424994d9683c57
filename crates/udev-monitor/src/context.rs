use crate::{
  device::DeviceError,
  native::{HandleClass, Library, OwnedHandle},
};
use std::{env, ffi::OsString, fmt, path::PathBuf, sync::Arc};
use tracing::{event, Level};

const SYS_PATH_VAR: &str = "SYSFS_PATH";
const DEFAULT_SYS_PATH: &str = "/sys";

/// A device library context. Every device, enumerator and monitor is
/// created from one.
#[derive(Clone)]
pub struct Context {
  handle: OwnedHandle,
}

impl Context {
  pub fn new(library: Arc<dyn Library>) -> Result<Self, DeviceError> {
    let raw = library.new_context().ok_or(DeviceError::Allocation {
      class: HandleClass::Context,
    })?;

    // SAFETY: a new context carries a reference.
    let handle = unsafe { OwnedHandle::from_raw(library, raw) };
    event!(target: "udev-monitor", Level::DEBUG, context = ?handle.as_raw(), "created device context");
    Ok(Self { handle })
  }

  /// A context backed by the system libudev.
  #[cfg(feature = "libudev")]
  pub fn libudev() -> Result<Self, DeviceError> {
    Self::new(Arc::new(crate::native::Libudev))
  }

  /// The sysfs mount point, overridable through `SYSFS_PATH`.
  pub fn sys_path(&self) -> PathBuf {
    sys_path_from(env::var_os(SYS_PATH_VAR))
  }

  pub(crate) fn handle(&self) -> &OwnedHandle {
    &self.handle
  }

  pub(crate) fn library(&self) -> &Arc<dyn Library> {
    self.handle.library()
  }
}

impl fmt::Debug for Context {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_tuple("Context").field(&self.handle.as_raw()).finish()
  }
}

fn sys_path_from(value: Option<OsString>) -> PathBuf {
  match value {
    Some(value) if !value.is_empty() => value.into(),
    _ => DEFAULT_SYS_PATH.into(),
  }
}
