//! Reference-counted handles into the native device library.
//!
//! The device library hands out opaque pointers whose lifetime is governed by
//! a reference count. Some calls return a pointer that already carries a
//! reference (anything that creates an object), others return a pointer that
//! is merely borrowed from another object (parent lookups). The two cases are
//! represented by [`OwnedHandle`] and [`BorrowedHandle`], and the only way from
//! the latter to the former is [`BorrowedHandle::acquire`], which takes a
//! fresh reference.

#[cfg(test)]
pub(crate) mod fake;
#[cfg(feature = "libudev")]
mod libudev;

#[cfg(feature = "libudev")]
pub use libudev::Libudev;

use std::{
  ffi::{c_void, CStr},
  fmt, io,
  os::unix::io::RawFd,
  ptr::NonNull,
  sync::Arc,
};

/// The kind of native object a handle points at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HandleClass {
  Context,
  Device,
  Enumerator,
  Monitor,
}

/// A bare, non-null pointer into the device library. Carries no ownership.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct RawHandle {
  ptr: NonNull<c_void>,
  class: HandleClass,
}

impl RawHandle {
  /// Returns `None` for a null pointer, which is how the library reports
  /// that an object could not be created or found.
  pub fn new(ptr: *mut c_void, class: HandleClass) -> Option<Self> {
    NonNull::new(ptr).map(|ptr| Self { ptr, class })
  }

  pub fn as_ptr(self) -> *mut c_void {
    self.ptr.as_ptr()
  }

  pub fn class(self) -> HandleClass {
    self.class
  }
}

impl fmt::Debug for RawHandle {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{:?}@{:p}", self.class, self.ptr)
  }
}

/// Character or block special device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceKind {
  Char,
  Block,
}

impl DeviceKind {
  pub fn as_type_char(self) -> u8 {
    match self {
      DeviceKind::Char => b'c',
      DeviceKind::Block => b'b',
    }
  }
}

/// Single-valued string fields of a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceField {
  DevPath,
  Subsystem,
  DevType,
  SysPath,
  SysName,
  SysNum,
  DevNode,
  Driver,
  Action,
}

/// Multi-valued fields of a device, read as `(name, value)` pairs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceList {
  Properties,
  DevLinks,
  Tags,
  SysAttrs,
}

/// A single enumeration match rule.
#[derive(Debug, Clone, Copy)]
pub enum EnumMatch<'a> {
  Subsystem(&'a CStr),
  NoSubsystem(&'a CStr),
  SysAttr(&'a CStr, Option<&'a CStr>),
  NoSysAttr(&'a CStr, Option<&'a CStr>),
  Property(&'a CStr, &'a CStr),
  Tag(&'a CStr),
  SysName(&'a CStr),
  Parent(RawHandle),
  IsInitialized,
}

/// The operations consumed from the native device library.
///
/// Every method that returns `Option<RawHandle>` documents whether the
/// returned pointer carries a reference. Passing a handle that was already
/// released is fatal misuse.
pub trait Library: Send + Sync {
  /// Creates a library context. Carries a reference.
  fn new_context(&self) -> Option<RawHandle>;

  /// Takes an additional reference on `handle`.
  fn acquire(&self, handle: RawHandle);

  /// Drops one reference on `handle`; the object is freed at zero.
  fn release(&self, handle: RawHandle);

  /// Looks a device up by its absolute sys path. Carries a reference.
  fn device_from_syspath(&self, context: RawHandle, syspath: &CStr) -> Option<RawHandle>;

  /// Looks a device up by subsystem and sys name. Carries a reference.
  fn device_from_subsystem_sysname(
    &self,
    context: RawHandle,
    subsystem: &CStr,
    sysname: &CStr,
  ) -> Option<RawHandle>;

  /// Looks a device up by its device number. Carries a reference.
  fn device_from_devnum(
    &self,
    context: RawHandle,
    kind: DeviceKind,
    devnum: u64,
  ) -> Option<RawHandle>;

  /// Returns the parent of `device`. The pointer is borrowed: it is owned by
  /// `device` and dies with it.
  fn device_parent(&self, device: RawHandle) -> Option<RawHandle>;

  /// Returns the closest ancestor with the given subsystem (and device type).
  /// The pointer is borrowed from `device`.
  fn device_parent_with_subsystem_devtype(
    &self,
    device: RawHandle,
    subsystem: &CStr,
    devtype: Option<&CStr>,
  ) -> Option<RawHandle>;

  fn device_field(&self, device: RawHandle, field: DeviceField) -> Option<String>;

  fn device_property(&self, device: RawHandle, name: &CStr) -> Option<String>;

  fn device_sysattr(&self, device: RawHandle, name: &CStr) -> Option<String>;

  fn device_list(&self, device: RawHandle, list: DeviceList) -> Vec<(String, Option<String>)>;

  /// Returns 0 if the device has no device number.
  fn device_devnum(&self, device: RawHandle) -> u64;

  fn device_is_initialized(&self, device: RawHandle) -> bool;

  /// Returns 0 for devices that did not come from a monitor.
  fn device_seqnum(&self, device: RawHandle) -> u64;

  /// Creates an enumerator. Carries a reference.
  fn enumerator_new(&self, context: RawHandle) -> Option<RawHandle>;

  fn enumerator_add_match(&self, enumerator: RawHandle, rule: EnumMatch<'_>) -> io::Result<()>;

  /// Scans sysfs and returns the sys paths of all matching devices.
  fn enumerator_scan(&self, enumerator: RawHandle) -> io::Result<Vec<String>>;

  /// Opens a netlink monitor. Carries a reference.
  fn monitor_new_from_netlink(&self, context: RawHandle, source: &CStr) -> Option<RawHandle>;

  fn monitor_enable_receiving(&self, monitor: RawHandle) -> io::Result<()>;

  fn monitor_set_receive_buffer_size(&self, monitor: RawHandle, size: i32) -> io::Result<()>;

  fn monitor_fd(&self, monitor: RawHandle) -> RawFd;

  /// Reads one device. Carries a reference. "No data" is reported as
  /// [`io::ErrorKind::WouldBlock`], a signal as [`io::ErrorKind::Interrupted`].
  fn monitor_receive_device(&self, monitor: RawHandle) -> io::Result<RawHandle>;

  fn monitor_filter_add_match_subsystem_devtype(
    &self,
    monitor: RawHandle,
    subsystem: &CStr,
    devtype: Option<&CStr>,
  ) -> io::Result<()>;

  fn monitor_filter_add_match_tag(&self, monitor: RawHandle, tag: &CStr) -> io::Result<()>;

  /// Commits the locally added match rules to the kernel.
  fn monitor_filter_update(&self, monitor: RawHandle) -> io::Result<()>;

  fn monitor_filter_remove(&self, monitor: RawHandle) -> io::Result<()>;
}

/// A handle that holds exactly one reference on its object.
pub struct OwnedHandle {
  raw: RawHandle,
  library: Arc<dyn Library>,
}

impl OwnedHandle {
  /// Takes over the reference carried by `raw`.
  ///
  /// # Safety
  ///
  /// `raw` must be a live handle produced by `library`, and the caller must
  /// own one reference on it which is transferred to the returned value.
  pub unsafe fn from_raw(library: Arc<dyn Library>, raw: RawHandle) -> Self {
    Self { raw, library }
  }

  pub fn as_raw(&self) -> RawHandle {
    self.raw
  }

  pub fn class(&self) -> HandleClass {
    self.raw.class
  }

  pub fn library(&self) -> &Arc<dyn Library> {
    &self.library
  }

  /// Wraps a pointer that `self`'s object owns, such as a cached parent.
  ///
  /// # Safety
  ///
  /// `raw` must stay valid for as long as `self` keeps its reference.
  pub unsafe fn borrow_related(&self, raw: RawHandle) -> BorrowedHandle<'_> {
    BorrowedHandle {
      raw,
      library: &self.library,
    }
  }
}

impl Clone for OwnedHandle {
  fn clone(&self) -> Self {
    self.library.acquire(self.raw);
    Self {
      raw: self.raw,
      library: self.library.clone(),
    }
  }
}

impl Drop for OwnedHandle {
  fn drop(&mut self) {
    self.library.release(self.raw);
  }
}

impl fmt::Debug for OwnedHandle {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_tuple("OwnedHandle").field(&self.raw).finish()
  }
}

// SAFETY: the library objects are not thread safe, but they may be moved to
// another thread as long as they are never used from two threads at once.
// `OwnedHandle` is deliberately not `Sync`.
unsafe impl Send for OwnedHandle {}

/// A handle that does not hold a reference; valid while its owner lives.
pub struct BorrowedHandle<'a> {
  raw: RawHandle,
  library: &'a Arc<dyn Library>,
}

impl<'a> BorrowedHandle<'a> {
  pub fn as_raw(&self) -> RawHandle {
    self.raw
  }

  /// Takes a reference, producing a handle that outlives the owner.
  pub fn acquire(&self) -> OwnedHandle {
    self.library.acquire(self.raw);
    OwnedHandle {
      raw: self.raw,
      library: self.library.clone(),
    }
  }
}

impl fmt::Debug for BorrowedHandle<'_> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_tuple("BorrowedHandle").field(&self.raw).finish()
  }
}
