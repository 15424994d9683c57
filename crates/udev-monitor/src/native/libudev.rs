use super::{DeviceField, DeviceKind, DeviceList, EnumMatch, HandleClass, Library, RawHandle};
use libudev_sys as ffi;
use std::{
  ffi::CStr,
  io,
  os::raw::{c_char, c_int},
  os::unix::io::RawFd,
  ptr,
};

/// The system libudev.
#[derive(Debug, Default, Clone, Copy)]
pub struct Libudev;

fn status(rc: c_int) -> io::Result<()> {
  if rc < 0 {
    Err(io::Error::from_raw_os_error(-rc))
  } else {
    Ok(())
  }
}

unsafe fn string(ptr: *const c_char) -> Option<String> {
  if ptr.is_null() {
    None
  } else {
    Some(CStr::from_ptr(ptr).to_string_lossy().into_owned())
  }
}

fn opt_ptr(value: Option<&CStr>) -> *const c_char {
  value.map_or(ptr::null(), CStr::as_ptr)
}

fn device(handle: RawHandle) -> *mut ffi::udev_device {
  debug_assert_eq!(handle.class(), HandleClass::Device);
  handle.as_ptr().cast()
}

fn monitor(handle: RawHandle) -> *mut ffi::udev_monitor {
  debug_assert_eq!(handle.class(), HandleClass::Monitor);
  handle.as_ptr().cast()
}

fn enumerator(handle: RawHandle) -> *mut ffi::udev_enumerate {
  debug_assert_eq!(handle.class(), HandleClass::Enumerator);
  handle.as_ptr().cast()
}

fn context(handle: RawHandle) -> *mut ffi::udev {
  debug_assert_eq!(handle.class(), HandleClass::Context);
  handle.as_ptr().cast()
}

fn new_device(ptr: *mut ffi::udev_device) -> Option<RawHandle> {
  RawHandle::new(ptr.cast(), HandleClass::Device)
}

unsafe fn list(mut entry: *mut ffi::udev_list_entry) -> Vec<(String, Option<String>)> {
  let mut items = Vec::new();
  while !entry.is_null() {
    if let Some(name) = string(ffi::udev_list_entry_get_name(entry)) {
      items.push((name, string(ffi::udev_list_entry_get_value(entry))));
    }
    entry = ffi::udev_list_entry_get_next(entry);
  }
  items
}

impl Library for Libudev {
  fn new_context(&self) -> Option<RawHandle> {
    RawHandle::new(unsafe { ffi::udev_new() }.cast(), HandleClass::Context)
  }

  fn acquire(&self, handle: RawHandle) {
    unsafe {
      match handle.class() {
        HandleClass::Context => {
          ffi::udev_ref(context(handle));
        }
        HandleClass::Device => {
          ffi::udev_device_ref(device(handle));
        }
        HandleClass::Enumerator => {
          ffi::udev_enumerate_ref(enumerator(handle));
        }
        HandleClass::Monitor => {
          ffi::udev_monitor_ref(monitor(handle));
        }
      }
    }
  }

  fn release(&self, handle: RawHandle) {
    unsafe {
      match handle.class() {
        HandleClass::Context => {
          ffi::udev_unref(context(handle));
        }
        HandleClass::Device => {
          ffi::udev_device_unref(device(handle));
        }
        HandleClass::Enumerator => {
          ffi::udev_enumerate_unref(enumerator(handle));
        }
        HandleClass::Monitor => {
          ffi::udev_monitor_unref(monitor(handle));
        }
      }
    }
  }

  fn device_from_syspath(&self, ctx: RawHandle, syspath: &CStr) -> Option<RawHandle> {
    new_device(unsafe { ffi::udev_device_new_from_syspath(context(ctx), syspath.as_ptr()) })
  }

  fn device_from_subsystem_sysname(
    &self,
    ctx: RawHandle,
    subsystem: &CStr,
    sysname: &CStr,
  ) -> Option<RawHandle> {
    new_device(unsafe {
      ffi::udev_device_new_from_subsystem_sysname(
        context(ctx),
        subsystem.as_ptr(),
        sysname.as_ptr(),
      )
    })
  }

  fn device_from_devnum(&self, ctx: RawHandle, kind: DeviceKind, devnum: u64) -> Option<RawHandle> {
    new_device(unsafe {
      ffi::udev_device_new_from_devnum(
        context(ctx),
        kind.as_type_char() as c_char,
        devnum as libc::dev_t,
      )
    })
  }

  fn device_parent(&self, dev: RawHandle) -> Option<RawHandle> {
    new_device(unsafe { ffi::udev_device_get_parent(device(dev)) })
  }

  fn device_parent_with_subsystem_devtype(
    &self,
    dev: RawHandle,
    subsystem: &CStr,
    devtype: Option<&CStr>,
  ) -> Option<RawHandle> {
    new_device(unsafe {
      ffi::udev_device_get_parent_with_subsystem_devtype(
        device(dev),
        subsystem.as_ptr(),
        opt_ptr(devtype),
      )
    })
  }

  fn device_field(&self, dev: RawHandle, field: DeviceField) -> Option<String> {
    let dev = device(dev);
    unsafe {
      string(match field {
        DeviceField::DevPath => ffi::udev_device_get_devpath(dev),
        DeviceField::Subsystem => ffi::udev_device_get_subsystem(dev),
        DeviceField::DevType => ffi::udev_device_get_devtype(dev),
        DeviceField::SysPath => ffi::udev_device_get_syspath(dev),
        DeviceField::SysName => ffi::udev_device_get_sysname(dev),
        DeviceField::SysNum => ffi::udev_device_get_sysnum(dev),
        DeviceField::DevNode => ffi::udev_device_get_devnode(dev),
        DeviceField::Driver => ffi::udev_device_get_driver(dev),
        DeviceField::Action => ffi::udev_device_get_action(dev),
      })
    }
  }

  fn device_property(&self, dev: RawHandle, name: &CStr) -> Option<String> {
    unsafe { string(ffi::udev_device_get_property_value(device(dev), name.as_ptr())) }
  }

  fn device_sysattr(&self, dev: RawHandle, name: &CStr) -> Option<String> {
    unsafe { string(ffi::udev_device_get_sysattr_value(device(dev), name.as_ptr())) }
  }

  fn device_list(&self, dev: RawHandle, which: DeviceList) -> Vec<(String, Option<String>)> {
    let dev = device(dev);
    unsafe {
      list(match which {
        DeviceList::Properties => ffi::udev_device_get_properties_list_entry(dev),
        DeviceList::DevLinks => ffi::udev_device_get_devlinks_list_entry(dev),
        DeviceList::Tags => ffi::udev_device_get_tags_list_entry(dev),
        DeviceList::SysAttrs => ffi::udev_device_get_sysattr_list_entry(dev),
      })
    }
  }

  fn device_devnum(&self, dev: RawHandle) -> u64 {
    unsafe { ffi::udev_device_get_devnum(device(dev)) as u64 }
  }

  fn device_is_initialized(&self, dev: RawHandle) -> bool {
    unsafe { ffi::udev_device_get_is_initialized(device(dev)) != 0 }
  }

  fn device_seqnum(&self, dev: RawHandle) -> u64 {
    unsafe { ffi::udev_device_get_seqnum(device(dev)) as u64 }
  }

  fn enumerator_new(&self, ctx: RawHandle) -> Option<RawHandle> {
    RawHandle::new(
      unsafe { ffi::udev_enumerate_new(context(ctx)) }.cast(),
      HandleClass::Enumerator,
    )
  }

  fn enumerator_add_match(&self, e: RawHandle, rule: EnumMatch<'_>) -> io::Result<()> {
    let e = enumerator(e);
    status(unsafe {
      match rule {
        EnumMatch::Subsystem(s) => ffi::udev_enumerate_add_match_subsystem(e, s.as_ptr()),
        EnumMatch::NoSubsystem(s) => ffi::udev_enumerate_add_nomatch_subsystem(e, s.as_ptr()),
        EnumMatch::SysAttr(n, v) => ffi::udev_enumerate_add_match_sysattr(e, n.as_ptr(), opt_ptr(v)),
        EnumMatch::NoSysAttr(n, v) => {
          ffi::udev_enumerate_add_nomatch_sysattr(e, n.as_ptr(), opt_ptr(v))
        }
        EnumMatch::Property(k, v) => ffi::udev_enumerate_add_match_property(e, k.as_ptr(), v.as_ptr()),
        EnumMatch::Tag(t) => ffi::udev_enumerate_add_match_tag(e, t.as_ptr()),
        EnumMatch::SysName(n) => ffi::udev_enumerate_add_match_sysname(e, n.as_ptr()),
        EnumMatch::Parent(parent) => ffi::udev_enumerate_add_match_parent(e, device(parent)),
        EnumMatch::IsInitialized => ffi::udev_enumerate_add_match_is_initialized(e),
      }
    })
  }

  fn enumerator_scan(&self, e: RawHandle) -> io::Result<Vec<String>> {
    let e = enumerator(e);
    unsafe {
      status(ffi::udev_enumerate_scan_devices(e))?;
      Ok(
        list(ffi::udev_enumerate_get_list_entry(e))
          .into_iter()
          .map(|(syspath, _)| syspath)
          .collect(),
      )
    }
  }

  fn monitor_new_from_netlink(&self, ctx: RawHandle, source: &CStr) -> Option<RawHandle> {
    RawHandle::new(
      unsafe { ffi::udev_monitor_new_from_netlink(context(ctx), source.as_ptr()) }.cast(),
      HandleClass::Monitor,
    )
  }

  fn monitor_enable_receiving(&self, mon: RawHandle) -> io::Result<()> {
    status(unsafe { ffi::udev_monitor_enable_receiving(monitor(mon)) })
  }

  fn monitor_set_receive_buffer_size(&self, mon: RawHandle, size: i32) -> io::Result<()> {
    status(unsafe { ffi::udev_monitor_set_receive_buffer_size(monitor(mon), size) })
  }

  fn monitor_fd(&self, mon: RawHandle) -> RawFd {
    unsafe { ffi::udev_monitor_get_fd(monitor(mon)) }
  }

  fn monitor_receive_device(&self, mon: RawHandle) -> io::Result<RawHandle> {
    // a null return does not always set errno
    let ptr = unsafe {
      *libc::__errno_location() = 0;
      ffi::udev_monitor_receive_device(monitor(mon))
    };
    new_device(ptr).ok_or_else(|| {
      let error = io::Error::last_os_error();
      match error.raw_os_error() {
        // a message was read but dropped by the library's own checks
        Some(0) | None => io::ErrorKind::WouldBlock.into(),
        _ => error,
      }
    })
  }

  fn monitor_filter_add_match_subsystem_devtype(
    &self,
    mon: RawHandle,
    subsystem: &CStr,
    devtype: Option<&CStr>,
  ) -> io::Result<()> {
    status(unsafe {
      ffi::udev_monitor_filter_add_match_subsystem_devtype(
        monitor(mon),
        subsystem.as_ptr(),
        opt_ptr(devtype),
      )
    })
  }

  fn monitor_filter_add_match_tag(&self, mon: RawHandle, tag: &CStr) -> io::Result<()> {
    status(unsafe { ffi::udev_monitor_filter_add_match_tag(monitor(mon), tag.as_ptr()) })
  }

  fn monitor_filter_update(&self, mon: RawHandle) -> io::Result<()> {
    status(unsafe { ffi::udev_monitor_filter_update(monitor(mon)) })
  }

  fn monitor_filter_remove(&self, mon: RawHandle) -> io::Result<()> {
    status(unsafe { ffi::udev_monitor_filter_remove(monitor(mon)) })
  }
}
