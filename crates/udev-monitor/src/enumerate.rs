use crate::{
  context::Context,
  device::{c_arg, Device, DeviceError},
  native::{EnumMatch, HandleClass, OwnedHandle},
};
use std::ffi::CString;

/// Lists devices currently present in sysfs.
///
/// Matches of the same kind are combined with OR (`match_subsystem("a")` and
/// `match_subsystem("b")` finds devices in either), different kinds with AND.
pub struct Enumerator {
  handle: OwnedHandle,
  context: Context,
}

impl Enumerator {
  pub fn new(context: &Context) -> Result<Self, DeviceError> {
    let raw = context
      .library()
      .enumerator_new(context.handle().as_raw())
      .ok_or(DeviceError::Allocation {
        class: HandleClass::Enumerator,
      })?;

    // SAFETY: a new enumerator carries a reference.
    let handle = unsafe { OwnedHandle::from_raw(context.library().clone(), raw) };
    Ok(Self {
      handle,
      context: context.clone(),
    })
  }

  fn add(&mut self, rule: EnumMatch<'_>) -> Result<&mut Self, DeviceError> {
    self
      .handle
      .library()
      .enumerator_add_match(self.handle.as_raw(), rule)?;
    Ok(self)
  }

  pub fn match_subsystem(&mut self, subsystem: &str) -> Result<&mut Self, DeviceError> {
    let subsystem = c_arg(subsystem)?;
    self.add(EnumMatch::Subsystem(&subsystem))
  }

  pub fn nomatch_subsystem(&mut self, subsystem: &str) -> Result<&mut Self, DeviceError> {
    let subsystem = c_arg(subsystem)?;
    self.add(EnumMatch::NoSubsystem(&subsystem))
  }

  /// Without a value, any device that has the attribute matches.
  pub fn match_attribute(
    &mut self,
    name: &str,
    value: Option<&str>,
  ) -> Result<&mut Self, DeviceError> {
    let (name, value) = attribute_args(name, value)?;
    self.add(EnumMatch::SysAttr(&name, value.as_deref()))
  }

  pub fn nomatch_attribute(
    &mut self,
    name: &str,
    value: Option<&str>,
  ) -> Result<&mut Self, DeviceError> {
    let (name, value) = attribute_args(name, value)?;
    self.add(EnumMatch::NoSysAttr(&name, value.as_deref()))
  }

  pub fn match_property(&mut self, key: &str, value: &str) -> Result<&mut Self, DeviceError> {
    let (key, value) = (c_arg(key)?, c_arg(value)?);
    self.add(EnumMatch::Property(&key, &value))
  }

  pub fn match_tag(&mut self, tag: &str) -> Result<&mut Self, DeviceError> {
    let tag = c_arg(tag)?;
    self.add(EnumMatch::Tag(&tag))
  }

  pub fn match_sys_name(&mut self, sys_name: &str) -> Result<&mut Self, DeviceError> {
    let sys_name = c_arg(sys_name)?;
    self.add(EnumMatch::SysName(&sys_name))
  }

  /// Restricts the scan to `parent` and the devices below it.
  pub fn match_parent(&mut self, parent: &Device) -> Result<&mut Self, DeviceError> {
    self.add(EnumMatch::Parent(parent.raw()))
  }

  pub fn match_is_initialized(&mut self) -> Result<&mut Self, DeviceError> {
    self.add(EnumMatch::IsInitialized)
  }

  /// Devices that vanish between the scan and the lookup are skipped.
  pub fn scan(&self) -> Result<Vec<Device>, DeviceError> {
    let sys_paths = self
      .handle
      .library()
      .enumerator_scan(self.handle.as_raw())?;

    let mut devices = Vec::with_capacity(sys_paths.len());
    for sys_path in sys_paths {
      match Device::from_sys_path(&self.context, &sys_path) {
        Ok(device) => devices.push(device),
        Err(DeviceError::NotFound { .. }) => continue,
        Err(e) => return Err(e),
      }
    }
    Ok(devices)
  }
}

fn attribute_args(name: &str, value: Option<&str>) -> Result<(CString, Option<CString>), DeviceError> {
  Ok((c_arg(name)?, value.map(c_arg).transpose()?))
}
