use crate::{
  context::Context,
  device::{Device, DeviceError},
  native::{HandleClass, OwnedHandle},
  poll::{Poll, PollError},
};
use serde::{Deserialize, Serialize};
use std::{
  convert::TryFrom,
  ffi::CString,
  fmt, io, iter,
  os::{raw::c_int, unix::io::{AsRawFd, RawFd}},
  str::FromStr,
  time::Duration,
};
use thiserror::Error;
use tracing::{event, Level};

#[derive(Debug, Error)]
pub enum MonitorError {
  #[error("Invalid event source {0:?}, expected \"udev\" or \"kernel\"")]
  InvalidSource(String),

  #[error("Device library could not create a monitor")]
  Allocation,

  #[error("Not permitted to change the receive buffer size")]
  PermissionDenied(#[source] io::Error),

  #[error("Invalid argument: {0}")]
  InvalidArgument(String),

  #[error(transparent)]
  Io(#[from] io::Error),

  #[error(transparent)]
  Poll(#[from] PollError),

  #[error(transparent)]
  Device(#[from] DeviceError),
}

/// Which netlink group a monitor listens on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventSource {
  /// Events after udev processed them. Devices are fully initialized.
  Udev,
  /// Raw kernel uevents, before any rule ran.
  Kernel,
}

impl EventSource {
  pub fn as_str(self) -> &'static str {
    match self {
      EventSource::Udev => "udev",
      EventSource::Kernel => "kernel",
    }
  }
}

impl Default for EventSource {
  fn default() -> Self {
    EventSource::Udev
  }
}

impl FromStr for EventSource {
  type Err = MonitorError;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s {
      "udev" => Ok(EventSource::Udev),
      "kernel" => Ok(EventSource::Kernel),
      other => Err(MonitorError::InvalidSource(other.into())),
    }
  }
}

impl fmt::Display for EventSource {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

fn filter_arg(what: &str, value: &str) -> Result<CString, MonitorError> {
  if value.is_empty() {
    return Err(MonitorError::InvalidArgument(format!("empty {}", what)));
  }
  CString::new(value)
    .map_err(|_| MonitorError::InvalidArgument(format!("{} contains a NUL byte: {:?}", what, value)))
}

/// A netlink listener for device events.
///
/// Filters are applied in the kernel, so events that do not match never
/// reach user space. Call [`Monitor::start`] (or just [`Monitor::poll`]) to
/// begin receiving.
pub struct Monitor {
  handle: OwnedHandle,
  context: Context,
  source: EventSource,
  started: bool,
}

impl Monitor {
  /// Opens a monitor on `source`, which must be `"udev"` or `"kernel"`.
  pub fn from_netlink(context: &Context, source: &str) -> Result<Self, MonitorError> {
    Self::with_source(context, source.parse()?)
  }

  pub fn with_source(context: &Context, source: EventSource) -> Result<Self, MonitorError> {
    let name = CString::new(source.as_str()).map_err(|_| MonitorError::InvalidSource(source.to_string()))?;
    let raw = context
      .library()
      .monitor_new_from_netlink(context.handle().as_raw(), &name)
      .ok_or(MonitorError::Allocation)?;

    // SAFETY: a new monitor carries a reference.
    let handle = unsafe { OwnedHandle::from_raw(context.library().clone(), raw) };
    debug_assert_eq!(handle.class(), HandleClass::Monitor);
    event!(target: "udev-monitor", Level::DEBUG, monitor.source = %source, "created monitor");

    Ok(Self {
      handle,
      context: context.clone(),
      source,
      started: false,
    })
  }

  pub fn context(&self) -> &Context {
    &self.context
  }

  pub fn source(&self) -> EventSource {
    self.source
  }

  /// Only receive events for devices in `subsystem`, and of `device_type`
  /// if given. Filters add up: a device matching any subsystem filter
  /// passes.
  pub fn filter_by(&mut self, subsystem: &str, device_type: Option<&str>) -> Result<(), MonitorError> {
    let subsystem_arg = filter_arg("subsystem", subsystem)?;
    let device_type_arg = device_type.map(|t| filter_arg("device type", t)).transpose()?;

    let library = self.handle.library();
    library.monitor_filter_add_match_subsystem_devtype(
      self.handle.as_raw(),
      &subsystem_arg,
      device_type_arg.as_deref(),
    )?;
    library.monitor_filter_update(self.handle.as_raw())?;
    event!(target: "udev-monitor", Level::DEBUG, filter.subsystem = %subsystem, filter.device_type = ?device_type, "committed monitor filter");
    Ok(())
  }

  /// Only receive events for devices carrying `tag`.
  pub fn filter_by_tag(&mut self, tag: &str) -> Result<(), MonitorError> {
    let tag_arg = filter_arg("tag", tag)?;

    let library = self.handle.library();
    library.monitor_filter_add_match_tag(self.handle.as_raw(), &tag_arg)?;
    library.monitor_filter_update(self.handle.as_raw())?;
    event!(target: "udev-monitor", Level::DEBUG, filter.tag = %tag, "committed monitor filter");
    Ok(())
  }

  /// Removes all installed filters.
  ///
  /// This is best effort: the kernel filter is dropped, but the library may
  /// keep its local copy of the match rules.
  pub fn remove_filter(&mut self) -> Result<(), MonitorError> {
    self
      .handle
      .library()
      .monitor_filter_remove(self.handle.as_raw())?;
    event!(target: "udev-monitor", Level::DEBUG, "removed monitor filters");
    Ok(())
  }

  /// Starts receiving events. Calling this more than once is a no-op.
  pub fn start(&mut self) -> Result<(), MonitorError> {
    if self.started {
      return Ok(());
    }

    self
      .handle
      .library()
      .monitor_enable_receiving(self.handle.as_raw())?;
    set_nonblocking(self.as_raw_fd())?;
    self.started = true;
    event!(target: "udev-monitor", Level::DEBUG, monitor.fd = self.as_raw_fd(), "started monitor");
    Ok(())
  }

  pub fn is_started(&self) -> bool {
    self.started
  }

  /// Changes the kernel receive buffer of the netlink socket. Needs
  /// `CAP_NET_ADMIN`.
  pub fn set_receive_buffer_size(&mut self, size: usize) -> Result<(), MonitorError> {
    let size = c_int::try_from(size).map_err(|_| {
      MonitorError::InvalidArgument(format!("receive buffer size {} is too large", size))
    })?;

    match self
      .handle
      .library()
      .monitor_set_receive_buffer_size(self.handle.as_raw(), size)
    {
      Ok(()) => Ok(()),
      Err(e) if matches!(e.raw_os_error(), Some(libc::EPERM) | Some(libc::EACCES)) => {
        Err(MonitorError::PermissionDenied(e))
      }
      Err(e) => Err(e.into()),
    }
  }

  /// Waits up to `timeout` for the next device event.
  ///
  /// `None` waits forever, `Some(Duration::ZERO)` returns immediately.
  /// Returns `Ok(None)` if nothing arrived in time. Starts the monitor if
  /// needed.
  pub fn poll(&mut self, timeout: Option<Duration>) -> Result<Option<Device>, MonitorError> {
    self.start()?;
    let ready = Poll::for_events(iter::once(self.as_raw_fd())).poll(timeout)?;
    if ready.is_empty() {
      return Ok(None);
    }
    self.receive_device()
  }

  fn receive_device(&mut self) -> Result<Option<Device>, MonitorError> {
    loop {
      match self
        .handle
        .library()
        .monitor_receive_device(self.handle.as_raw())
      {
        Ok(raw) => {
          // SAFETY: received devices carry a reference.
          let handle = unsafe { OwnedHandle::from_raw(self.handle.library().clone(), raw) };
          return Ok(Some(Device::from_owned(&self.context, handle)?));
        }
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(None),
        Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
        Err(e) => return Err(e.into()),
      }
    }
  }
}

impl AsRawFd for Monitor {
  fn as_raw_fd(&self) -> RawFd {
    self.handle.library().monitor_fd(self.handle.as_raw())
  }
}

impl fmt::Debug for Monitor {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Monitor")
      .field("source", &self.source)
      .field("started", &self.started)
      .field("handle", &self.handle.as_raw())
      .finish()
  }
}

fn set_nonblocking(fd: RawFd) -> io::Result<()> {
  unsafe {
    let flags = libc::fcntl(fd, libc::F_GETFL);
    if flags < 0 {
      return Err(io::Error::last_os_error());
    }
    if flags & libc::O_NONBLOCK == 0 && libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) < 0 {
      return Err(io::Error::last_os_error());
    }
  }
  Ok(())
}
