mod action;

pub use action::Action;

use crate::{
  context::Context,
  enumerate::Enumerator,
  native::{DeviceField, DeviceKind, DeviceList, HandleClass, Library, OwnedHandle, RawHandle},
};
use std::{
  collections::BTreeMap,
  ffi::CString,
  fmt, fs,
  hash::{Hash, Hasher},
  io,
  os::unix::{
    ffi::OsStrExt,
    fs::{FileTypeExt, MetadataExt},
  },
  path::{Path, PathBuf},
  sync::Arc,
};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DeviceError {
  #[error("Device library could not allocate a {class:?} object")]
  Allocation { class: HandleClass },

  #[error("No device found for {lookup}")]
  NotFound { lookup: String },

  #[error("Device has no device path")]
  NoDevicePath,

  #[error("Argument contains a NUL byte: {0:?}")]
  InvalidArgument(String),

  #[error("{} is not a character or block device", .0.display())]
  NotADeviceFile(PathBuf),

  #[error(transparent)]
  Io(#[from] io::Error),
}

pub(crate) fn c_arg(value: &str) -> Result<CString, DeviceError> {
  CString::new(value).map_err(|_| DeviceError::InvalidArgument(value.into()))
}

fn c_path(value: &Path) -> Result<CString, DeviceError> {
  CString::new(value.as_os_str().as_bytes())
    .map_err(|_| DeviceError::InvalidArgument(value.display().to_string()))
}

/// A single kernel device.
///
/// Identity is the device path, which is read once when the device is
/// created. Everything else is read from the device library on access.
///
/// Devices compare equal when their device paths are equal, and can be
/// compared against a bare device path. They deliberately do not implement
/// `PartialOrd`: there is no meaningful ordering of devices.
pub struct Device {
  handle: OwnedHandle,
  context: Context,
  device_path: String,
}

impl Device {
  /// Wraps a handle that already carries a reference.
  pub(crate) fn from_owned(context: &Context, handle: OwnedHandle) -> Result<Self, DeviceError> {
    debug_assert_eq!(handle.class(), HandleClass::Device);
    let device_path = handle
      .library()
      .device_field(handle.as_raw(), DeviceField::DevPath)
      .ok_or(DeviceError::NoDevicePath)?;

    Ok(Self {
      handle,
      context: context.clone(),
      device_path,
    })
  }

  /// All `from_*` lookups return a pointer that carries a reference.
  fn from_lookup(
    context: &Context,
    raw: Option<RawHandle>,
    lookup: impl FnOnce() -> String,
  ) -> Result<Self, DeviceError> {
    let raw = raw.ok_or_else(|| DeviceError::NotFound { lookup: lookup() })?;

    // SAFETY: lookups hand out a referenced pointer.
    let handle = unsafe { OwnedHandle::from_raw(context.library().clone(), raw) };
    Self::from_owned(context, handle)
  }

  /// Looks a device up by its absolute sys path, e.g.
  /// `/sys/devices/virtual/input/input99`.
  pub fn from_sys_path(context: &Context, sys_path: impl AsRef<Path>) -> Result<Self, DeviceError> {
    let sys_path = sys_path.as_ref();
    let arg = c_path(sys_path)?;
    let raw = context
      .library()
      .device_from_syspath(context.handle().as_raw(), &arg);
    Self::from_lookup(context, raw, || sys_path.display().to_string())
  }

  /// Looks a device up by its device path, relative to the sysfs mount point.
  pub fn from_path(context: &Context, device_path: &str) -> Result<Self, DeviceError> {
    let sys_path = context
      .sys_path()
      .join(device_path.trim_start_matches('/'));
    Self::from_sys_path(context, sys_path)
  }

  /// Looks a device up by subsystem and sys name, e.g. `("net", "lo")`.
  pub fn from_name(context: &Context, subsystem: &str, sys_name: &str) -> Result<Self, DeviceError> {
    let (subsystem_arg, sys_name_arg) = (c_arg(subsystem)?, c_arg(sys_name)?);
    let raw = context.library().device_from_subsystem_sysname(
      context.handle().as_raw(),
      &subsystem_arg,
      &sys_name_arg,
    );
    Self::from_lookup(context, raw, || format!("{}/{}", subsystem, sys_name))
  }

  pub fn from_device_number(
    context: &Context,
    kind: DeviceKind,
    number: u64,
  ) -> Result<Self, DeviceError> {
    let raw = context
      .library()
      .device_from_devnum(context.handle().as_raw(), kind, number);
    Self::from_lookup(context, raw, || format!("{:?} device {}", kind, number))
  }

  /// Looks a device up by a device node such as `/dev/sda`.
  pub fn from_device_file(context: &Context, path: impl AsRef<Path>) -> Result<Self, DeviceError> {
    let path = path.as_ref();
    let metadata = fs::metadata(path)?;
    let file_type = metadata.file_type();
    let kind = if file_type.is_char_device() {
      DeviceKind::Char
    } else if file_type.is_block_device() {
      DeviceKind::Block
    } else {
      return Err(DeviceError::NotADeviceFile(path.into()));
    };

    Self::from_device_number(context, kind, metadata.rdev())
  }

  fn library(&self) -> &Arc<dyn Library> {
    self.handle.library()
  }

  fn field(&self, field: DeviceField) -> Option<String> {
    self.library().device_field(self.handle.as_raw(), field)
  }

  fn list(&self, list: DeviceList) -> Vec<(String, Option<String>)> {
    self.library().device_list(self.handle.as_raw(), list)
  }

  pub fn context(&self) -> &Context {
    &self.context
  }

  pub fn device_path(&self) -> &str {
    &self.device_path
  }

  pub fn sys_path(&self) -> PathBuf {
    match self.field(DeviceField::SysPath) {
      Some(path) => path.into(),
      None => self
        .context
        .sys_path()
        .join(self.device_path.trim_start_matches('/')),
    }
  }

  pub fn sys_name(&self) -> Option<String> {
    self.field(DeviceField::SysName)
  }

  /// The trailing number of the sys name, e.g. `99` for `input99`.
  pub fn sys_number(&self) -> Option<String> {
    self.field(DeviceField::SysNum)
  }

  pub fn subsystem(&self) -> Option<String> {
    self.field(DeviceField::Subsystem)
  }

  pub fn device_type(&self) -> Option<String> {
    self.field(DeviceField::DevType)
  }

  pub fn driver(&self) -> Option<String> {
    self.field(DeviceField::Driver)
  }

  pub fn device_node(&self) -> Option<PathBuf> {
    self.field(DeviceField::DevNode).map(PathBuf::from)
  }

  pub fn device_links(&self) -> Vec<PathBuf> {
    self
      .list(DeviceList::DevLinks)
      .into_iter()
      .map(|(link, _)| link.into())
      .collect()
  }

  /// 0 if the device has no device node.
  pub fn device_number(&self) -> u64 {
    self.library().device_devnum(self.handle.as_raw())
  }

  pub fn is_initialized(&self) -> bool {
    self.library().device_is_initialized(self.handle.as_raw())
  }

  /// Kernel event sequence number; 0 unless the device came from a monitor.
  pub fn sequence_number(&self) -> u64 {
    self.library().device_seqnum(self.handle.as_raw())
  }

  pub fn tags(&self) -> Vec<String> {
    self
      .list(DeviceList::Tags)
      .into_iter()
      .map(|(tag, _)| tag)
      .collect()
  }

  pub fn has_tag(&self, tag: &str) -> bool {
    self.tags().iter().any(|t| t == tag)
  }

  /// Only set for devices received from a monitor.
  pub fn action(&self) -> Option<Action> {
    self
      .field(DeviceField::Action)
      .map(|action| Action::from(action.as_str()))
  }

  pub fn property(&self, name: &str) -> Option<String> {
    let name = CString::new(name).ok()?;
    self.library().device_property(self.handle.as_raw(), &name)
  }

  pub fn properties(&self) -> BTreeMap<String, String> {
    self
      .list(DeviceList::Properties)
      .into_iter()
      .map(|(key, value)| (key, value.unwrap_or_default()))
      .collect()
  }

  /// Reads a sysfs attribute.
  pub fn attribute(&self, name: &str) -> Option<String> {
    let name = CString::new(name).ok()?;
    self.library().device_sysattr(self.handle.as_raw(), &name)
  }

  pub fn attribute_names(&self) -> Vec<String> {
    self
      .list(DeviceList::SysAttrs)
      .into_iter()
      .map(|(name, _)| name)
      .collect()
  }

  /// The immediate parent, if any.
  ///
  /// The library only lends out the parent pointer (it belongs to this
  /// device), so a reference is acquired before wrapping it. The returned
  /// parent stays valid after `self` is dropped.
  pub fn parent(&self) -> Option<Device> {
    let raw = self.library().device_parent(self.handle.as_raw())?;

    // SAFETY: the parent is cached by this device and lives as long as it.
    let parent = unsafe { self.handle.borrow_related(raw) };
    Device::from_owned(&self.context, parent.acquire()).ok()
  }

  /// The closest ancestor in `subsystem` (and of `device_type`, if given).
  pub fn find_parent(
    &self,
    subsystem: &str,
    device_type: Option<&str>,
  ) -> Result<Option<Device>, DeviceError> {
    let subsystem = c_arg(subsystem)?;
    let device_type = device_type.map(c_arg).transpose()?;
    let raw = match self.library().device_parent_with_subsystem_devtype(
      self.handle.as_raw(),
      &subsystem,
      device_type.as_deref(),
    ) {
      Some(raw) => raw,
      None => return Ok(None),
    };

    // SAFETY: as for `parent`, the ancestor is owned by this device.
    let parent = unsafe { self.handle.borrow_related(raw) };
    Device::from_owned(&self.context, parent.acquire()).map(Some)
  }

  /// This device followed by each of its parents.
  pub fn ancestors(&self) -> Ancestors {
    Ancestors(Some(self.clone()))
  }

  /// Every device below this one in the device tree.
  pub fn children(&self) -> Result<Vec<Device>, DeviceError> {
    let mut enumerator = Enumerator::new(&self.context)?;
    enumerator.match_parent(self)?;
    Ok(
      enumerator
        .scan()?
        .into_iter()
        .filter(|device| device != self)
        .collect(),
    )
  }

  pub(crate) fn raw(&self) -> RawHandle {
    self.handle.as_raw()
  }
}

impl Clone for Device {
  fn clone(&self) -> Self {
    Self {
      handle: self.handle.clone(),
      context: self.context.clone(),
      device_path: self.device_path.clone(),
    }
  }
}

impl fmt::Debug for Device {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Device")
      .field("device_path", &self.device_path)
      .field("handle", &self.handle.as_raw())
      .finish()
  }
}

impl fmt::Display for Device {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.device_path)
  }
}

impl PartialEq for Device {
  fn eq(&self, other: &Self) -> bool {
    self.device_path == other.device_path
  }
}

impl Eq for Device {}

impl Hash for Device {
  fn hash<H: Hasher>(&self, state: &mut H) {
    self.device_path.hash(state)
  }
}

impl PartialEq<str> for Device {
  fn eq(&self, other: &str) -> bool {
    self.device_path == other
  }
}

impl PartialEq<&str> for Device {
  fn eq(&self, other: &&str) -> bool {
    self.device_path == *other
  }
}

impl PartialEq<String> for Device {
  fn eq(&self, other: &String) -> bool {
    &self.device_path == other
  }
}

impl PartialEq<Device> for str {
  fn eq(&self, other: &Device) -> bool {
    other == self
  }
}

impl PartialEq<Device> for &str {
  fn eq(&self, other: &Device) -> bool {
    other == *self
  }
}

impl PartialEq<Device> for String {
  fn eq(&self, other: &Device) -> bool {
    other == self
  }
}

pub struct Ancestors(Option<Device>);

impl Iterator for Ancestors {
  type Item = Device;

  fn next(&mut self) -> Option<Self::Item> {
    match self.0.take() {
      None => None,
      Some(d) => {
        self.0 = d.parent();
        Some(d)
      }
    }
  }
}
