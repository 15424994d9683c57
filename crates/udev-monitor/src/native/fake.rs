//! An in-memory device library for tests.
//!
//! Devices live in a table keyed by device path. Objects are reference
//! counted and ids are never reused, so touching or releasing a freed handle
//! panics. A device caches its parent the way libudev does: the parent
//! object is owned by the child and released together with it.
//!
//! Monitors are backed by a `UnixDatagram` pair. Every delivered event writes
//! one byte, so the monitor descriptor is really pollable.

use super::{DeviceField, DeviceKind, DeviceList, EnumMatch, HandleClass, Library, RawHandle};
use std::{
  collections::{BTreeMap, HashMap, VecDeque},
  ffi::{c_void, CStr},
  io,
  net::Shutdown,
  os::unix::{
    io::{AsRawFd, RawFd},
    net::UnixDatagram,
  },
  sync::{Arc, Mutex, MutexGuard},
};

pub(crate) const SYS_ROOT: &str = "/sys";

#[derive(Debug, Clone, Default)]
pub(crate) struct FakeDevice {
  pub(crate) devpath: String,
  pub(crate) subsystem: Option<String>,
  pub(crate) devtype: Option<String>,
  pub(crate) driver: Option<String>,
  pub(crate) devnode: Option<String>,
  pub(crate) devnum: Option<(DeviceKind, u64)>,
  pub(crate) devlinks: Vec<String>,
  pub(crate) tags: Vec<String>,
  pub(crate) properties: BTreeMap<String, String>,
  pub(crate) attributes: BTreeMap<String, String>,
  pub(crate) initialized: bool,
}

impl FakeDevice {
  pub(crate) fn new(devpath: &str, subsystem: &str) -> Self {
    Self {
      devpath: devpath.into(),
      subsystem: Some(subsystem.into()),
      initialized: true,
      ..Default::default()
    }
  }

  pub(crate) fn devtype(mut self, devtype: &str) -> Self {
    self.devtype = Some(devtype.into());
    self
  }

  pub(crate) fn driver(mut self, driver: &str) -> Self {
    self.driver = Some(driver.into());
    self
  }

  pub(crate) fn devnode(mut self, devnode: &str, kind: DeviceKind, devnum: u64) -> Self {
    self.devnode = Some(devnode.into());
    self.devnum = Some((kind, devnum));
    self
  }

  pub(crate) fn devlink(mut self, link: &str) -> Self {
    self.devlinks.push(link.into());
    self
  }

  pub(crate) fn tag(mut self, tag: &str) -> Self {
    self.tags.push(tag.into());
    self
  }

  pub(crate) fn property(mut self, key: &str, value: &str) -> Self {
    self.properties.insert(key.into(), value.into());
    self
  }

  pub(crate) fn attribute(mut self, name: &str, value: &str) -> Self {
    self.attributes.insert(name.into(), value.into());
    self
  }

  pub(crate) fn uninitialized(mut self) -> Self {
    self.initialized = false;
    self
  }

  fn sysname(&self) -> &str {
    self.devpath.rsplit('/').next().unwrap_or_default()
  }

  fn sysnum(&self) -> Option<String> {
    let name = self.sysname();
    let digits = name.len() - name.trim_end_matches(|c: char| c.is_ascii_digit()).len();
    if digits == 0 {
      None
    } else {
      Some(name[name.len() - digits..].to_owned())
    }
  }

  fn all_properties(&self, action: Option<&str>) -> BTreeMap<String, String> {
    let mut properties = self.properties.clone();
    properties.insert("DEVPATH".into(), self.devpath.clone());
    if let Some(subsystem) = &self.subsystem {
      properties.insert("SUBSYSTEM".into(), subsystem.clone());
    }
    if let Some(devtype) = &self.devtype {
      properties.insert("DEVTYPE".into(), devtype.clone());
    }
    if let Some(devnode) = &self.devnode {
      properties.insert("DEVNAME".into(), devnode.clone());
    }
    if let Some(action) = action {
      properties.insert("ACTION".into(), action.into());
    }
    properties
  }
}

#[derive(Debug, Clone)]
enum Rule {
  Subsystem(String, Option<String>),
  Tag(String),
}

fn rules_match(rules: &[Rule], device: &FakeDevice) -> bool {
  let mut subsystems = rules
    .iter()
    .filter_map(|r| match r {
      Rule::Subsystem(s, t) => Some((s, t)),
      _ => None,
    })
    .peekable();
  let subsystem_ok = subsystems.peek().is_none()
    || subsystems.any(|(s, t)| {
      device.subsystem.as_ref() == Some(s)
        && t.as_ref().map_or(true, |t| device.devtype.as_ref() == Some(t))
    });

  let mut tags = rules
    .iter()
    .filter_map(|r| match r {
      Rule::Tag(t) => Some(t),
      _ => None,
    })
    .peekable();
  let tag_ok = tags.peek().is_none() || tags.any(|t| device.tags.contains(t));

  subsystem_ok && tag_ok
}

#[derive(Debug, Clone)]
enum OwnedMatch {
  Subsystem(String),
  NoSubsystem(String),
  SysAttr(String, Option<String>),
  NoSysAttr(String, Option<String>),
  Property(String, String),
  Tag(String),
  SysName(String),
  Parent(String),
  IsInitialized,
}

struct FakeMonitor {
  reader: UnixDatagram,
  writer: UnixDatagram,
  queue: VecDeque<(FakeDevice, String)>,
  pending: Vec<Rule>,
  committed: Vec<Rule>,
  receiving: bool,
}

enum Object {
  Context,
  Device {
    record: FakeDevice,
    action: Option<String>,
    seqnum: u64,
    parent: Option<usize>,
  },
  Enumerator(Vec<OwnedMatch>),
  Monitor(Box<FakeMonitor>),
}

struct Entry {
  refs: usize,
  object: Object,
}

#[derive(Default)]
struct State {
  devices: BTreeMap<String, FakeDevice>,
  objects: HashMap<usize, Entry>,
  next_id: usize,
  seqnum: u64,
  interrupts: usize,
  privileged: bool,
  fail_allocation: bool,
  buffer_size: Option<i32>,
}

fn id(handle: RawHandle) -> usize {
  handle.as_ptr() as usize
}

fn text(value: &CStr) -> String {
  value.to_string_lossy().into_owned()
}

impl State {
  fn insert(&mut self, class: HandleClass, object: Object) -> RawHandle {
    self.next_id += 1;
    let id = self.next_id;
    self.objects.insert(id, Entry { refs: 1, object });
    RawHandle::new(id as *mut c_void, class).unwrap()
  }

  fn entry(&self, handle: RawHandle) -> &Entry {
    self
      .objects
      .get(&id(handle))
      .unwrap_or_else(|| panic!("use of released handle {:?}", handle))
  }

  fn entry_mut(&mut self, handle: RawHandle) -> &mut Entry {
    self
      .objects
      .get_mut(&id(handle))
      .unwrap_or_else(|| panic!("use of released handle {:?}", handle))
  }

  fn device(&self, handle: RawHandle) -> (&FakeDevice, Option<&str>, u64) {
    match &self.entry(handle).object {
      Object::Device {
        record,
        action,
        seqnum,
        ..
      } => (record, action.as_deref(), *seqnum),
      _ => panic!("{:?} is not a device", handle),
    }
  }

  fn monitor(&mut self, handle: RawHandle) -> &mut FakeMonitor {
    match &mut self.entry_mut(handle).object {
      Object::Monitor(monitor) => &mut **monitor,
      _ => panic!("{:?} is not a monitor", handle),
    }
  }

  fn new_device(&mut self, record: FakeDevice, action: Option<String>, seqnum: u64) -> RawHandle {
    self.insert(
      HandleClass::Device,
      Object::Device {
        record,
        action,
        seqnum,
        parent: None,
      },
    )
  }

  fn lookup(&mut self, devpath: &str) -> Option<RawHandle> {
    let record = self.devices.get(devpath)?.clone();
    Some(self.new_device(record, None, 0))
  }

  fn parent_record(&self, devpath: &str) -> Option<FakeDevice> {
    let mut path = devpath;
    while let Some(idx) = path.rfind('/') {
      path = &path[..idx];
      if let Some(record) = self.devices.get(path) {
        return Some(record.clone());
      }
    }
    None
  }

  fn cached_parent(&mut self, child: RawHandle, record: FakeDevice) -> RawHandle {
    if let Object::Device {
      parent: Some(parent),
      ..
    } = &self.entry(child).object
    {
      return RawHandle::new(*parent as *mut c_void, HandleClass::Device).unwrap();
    }

    let parent = self.new_device(record, None, 0);
    if let Object::Device { parent: slot, .. } = &mut self.entry_mut(child).object {
      *slot = Some(id(parent));
    }
    parent
  }

  fn release(&mut self, handle: RawHandle) {
    let mut pending = vec![id(handle)];
    while let Some(current) = pending.pop() {
      let entry = self
        .objects
        .get_mut(&current)
        .unwrap_or_else(|| panic!("release of released handle {:?}", handle));
      entry.refs -= 1;
      if entry.refs == 0 {
        if let Some(Entry {
          object: Object::Device {
            parent: Some(parent),
            ..
          },
          ..
        }) = self.objects.remove(&current)
        {
          pending.push(parent);
        }
      }
    }
  }
}

pub(crate) struct FakeLibrary {
  state: Mutex<State>,
}

impl FakeLibrary {
  pub(crate) fn new() -> Arc<Self> {
    Arc::new(Self {
      state: Mutex::new(State::default()),
    })
  }

  fn lock(&self) -> MutexGuard<'_, State> {
    self.state.lock().unwrap_or_else(|e| e.into_inner())
  }

  pub(crate) fn add_device(&self, device: FakeDevice) {
    self.lock().devices.insert(device.devpath.clone(), device);
  }

  /// Broadcasts an event for a known device to every receiving monitor whose
  /// committed filters match. Returns the number of monitors reached.
  pub(crate) fn emit(&self, action: &str, devpath: &str) -> usize {
    let mut state = self.lock();
    let record = state
      .devices
      .get(devpath)
      .cloned()
      .unwrap_or_else(|| panic!("unknown device {}", devpath));

    let mut delivered = 0;
    for entry in state.objects.values_mut() {
      if let Object::Monitor(monitor) = &mut entry.object {
        if monitor.receiving && rules_match(&monitor.committed, &record) {
          monitor.queue.push_back((record.clone(), action.into()));
          monitor.writer.send(&[1]).unwrap();
          delivered += 1;
        }
      }
    }
    delivered
  }

  /// The next `count` receive calls fail with `EINTR`.
  pub(crate) fn interrupt_receives(&self, count: usize) {
    self.lock().interrupts += count;
  }

  pub(crate) fn grant_privilege(&self) {
    self.lock().privileged = true;
  }

  pub(crate) fn fail_allocation(&self) {
    self.lock().fail_allocation = true;
  }

  /// Shuts every monitor socket down, which makes it report hang-up.
  pub(crate) fn hang_up_monitors(&self) {
    let state = self.lock();
    for entry in state.objects.values() {
      if let Object::Monitor(monitor) = &entry.object {
        monitor.reader.shutdown(Shutdown::Both).unwrap();
      }
    }
  }

  pub(crate) fn refcount(&self, handle: RawHandle) -> usize {
    self
      .lock()
      .objects
      .get(&id(handle))
      .map_or(0, |entry| entry.refs)
  }

  pub(crate) fn live_objects(&self, class: HandleClass) -> usize {
    self
      .lock()
      .objects
      .values()
      .filter(|entry| {
        let object_class = match entry.object {
          Object::Context => HandleClass::Context,
          Object::Device { .. } => HandleClass::Device,
          Object::Enumerator(_) => HandleClass::Enumerator,
          Object::Monitor(_) => HandleClass::Monitor,
        };
        object_class == class
      })
      .count()
  }

  pub(crate) fn receive_buffer_size(&self) -> Option<i32> {
    self.lock().buffer_size
  }
}

impl Library for FakeLibrary {
  fn new_context(&self) -> Option<RawHandle> {
    let mut state = self.lock();
    if state.fail_allocation {
      return None;
    }
    Some(state.insert(HandleClass::Context, Object::Context))
  }

  fn acquire(&self, handle: RawHandle) {
    self.lock().entry_mut(handle).refs += 1;
  }

  fn release(&self, handle: RawHandle) {
    self.lock().release(handle);
  }

  fn device_from_syspath(&self, context: RawHandle, syspath: &CStr) -> Option<RawHandle> {
    let mut state = self.lock();
    state.entry(context);
    let syspath = text(syspath);
    let devpath = syspath.strip_prefix(SYS_ROOT)?;
    state.lookup(devpath)
  }

  fn device_from_subsystem_sysname(
    &self,
    context: RawHandle,
    subsystem: &CStr,
    sysname: &CStr,
  ) -> Option<RawHandle> {
    let mut state = self.lock();
    state.entry(context);
    let (subsystem, sysname) = (text(subsystem), text(sysname));
    let devpath = state
      .devices
      .values()
      .find(|d| d.subsystem.as_deref() == Some(&*subsystem) && d.sysname() == sysname)?
      .devpath
      .clone();
    state.lookup(&devpath)
  }

  fn device_from_devnum(
    &self,
    context: RawHandle,
    kind: DeviceKind,
    devnum: u64,
  ) -> Option<RawHandle> {
    let mut state = self.lock();
    state.entry(context);
    let devpath = state
      .devices
      .values()
      .find(|d| d.devnum == Some((kind, devnum)))?
      .devpath
      .clone();
    state.lookup(&devpath)
  }

  fn device_parent(&self, device: RawHandle) -> Option<RawHandle> {
    let mut state = self.lock();
    let devpath = state.device(device).0.devpath.clone();
    let record = state.parent_record(&devpath)?;
    Some(state.cached_parent(device, record))
  }

  fn device_parent_with_subsystem_devtype(
    &self,
    device: RawHandle,
    subsystem: &CStr,
    devtype: Option<&CStr>,
  ) -> Option<RawHandle> {
    let (subsystem, devtype) = (text(subsystem), devtype.map(text));
    let mut current = device;
    loop {
      let parent = self.device_parent(current)?;
      let state = self.lock();
      let (record, _, _) = state.device(parent);
      if record.subsystem.as_deref() == Some(&*subsystem)
        && devtype
          .as_deref()
          .map_or(true, |t| record.devtype.as_deref() == Some(t))
      {
        return Some(parent);
      }
      current = parent;
    }
  }

  fn device_field(&self, device: RawHandle, field: DeviceField) -> Option<String> {
    let state = self.lock();
    let (record, action, _) = state.device(device);
    match field {
      DeviceField::DevPath => Some(record.devpath.clone()),
      DeviceField::Subsystem => record.subsystem.clone(),
      DeviceField::DevType => record.devtype.clone(),
      DeviceField::SysPath => Some(format!("{}{}", SYS_ROOT, record.devpath)),
      DeviceField::SysName => Some(record.sysname().to_owned()),
      DeviceField::SysNum => record.sysnum(),
      DeviceField::DevNode => record.devnode.clone(),
      DeviceField::Driver => record.driver.clone(),
      DeviceField::Action => action.map(String::from),
    }
  }

  fn device_property(&self, device: RawHandle, name: &CStr) -> Option<String> {
    let state = self.lock();
    let (record, action, _) = state.device(device);
    record.all_properties(action).remove(&text(name))
  }

  fn device_sysattr(&self, device: RawHandle, name: &CStr) -> Option<String> {
    let state = self.lock();
    state.device(device).0.attributes.get(&text(name)).cloned()
  }

  fn device_list(&self, device: RawHandle, list: DeviceList) -> Vec<(String, Option<String>)> {
    let state = self.lock();
    let (record, action, _) = state.device(device);
    match list {
      DeviceList::Properties => record
        .all_properties(action)
        .into_iter()
        .map(|(k, v)| (k, Some(v)))
        .collect(),
      DeviceList::DevLinks => record.devlinks.iter().map(|l| (l.clone(), None)).collect(),
      DeviceList::Tags => record.tags.iter().map(|t| (t.clone(), None)).collect(),
      DeviceList::SysAttrs => record.attributes.keys().map(|a| (a.clone(), None)).collect(),
    }
  }

  fn device_devnum(&self, device: RawHandle) -> u64 {
    let state = self.lock();
    state.device(device).0.devnum.map_or(0, |(_, n)| n)
  }

  fn device_is_initialized(&self, device: RawHandle) -> bool {
    self.lock().device(device).0.initialized
  }

  fn device_seqnum(&self, device: RawHandle) -> u64 {
    self.lock().device(device).2
  }

  fn enumerator_new(&self, context: RawHandle) -> Option<RawHandle> {
    let mut state = self.lock();
    state.entry(context);
    Some(state.insert(HandleClass::Enumerator, Object::Enumerator(Vec::new())))
  }

  fn enumerator_add_match(&self, enumerator: RawHandle, rule: EnumMatch<'_>) -> io::Result<()> {
    let mut state = self.lock();
    let rule = match rule {
      EnumMatch::Subsystem(s) => OwnedMatch::Subsystem(text(s)),
      EnumMatch::NoSubsystem(s) => OwnedMatch::NoSubsystem(text(s)),
      EnumMatch::SysAttr(n, v) => OwnedMatch::SysAttr(text(n), v.map(text)),
      EnumMatch::NoSysAttr(n, v) => OwnedMatch::NoSysAttr(text(n), v.map(text)),
      EnumMatch::Property(k, v) => OwnedMatch::Property(text(k), text(v)),
      EnumMatch::Tag(t) => OwnedMatch::Tag(text(t)),
      EnumMatch::SysName(n) => OwnedMatch::SysName(text(n)),
      EnumMatch::Parent(parent) => OwnedMatch::Parent(state.device(parent).0.devpath.clone()),
      EnumMatch::IsInitialized => OwnedMatch::IsInitialized,
    };
    match &mut state.entry_mut(enumerator).object {
      Object::Enumerator(rules) => rules.push(rule),
      _ => panic!("{:?} is not an enumerator", enumerator),
    }
    Ok(())
  }

  fn enumerator_scan(&self, enumerator: RawHandle) -> io::Result<Vec<String>> {
    let state = self.lock();
    let rules = match &state.entry(enumerator).object {
      Object::Enumerator(rules) => rules,
      _ => panic!("{:?} is not an enumerator", enumerator),
    };

    let matches = |device: &FakeDevice| {
      let subsystems: Vec<_> = rules
        .iter()
        .filter_map(|r| match r {
          OwnedMatch::Subsystem(s) => Some(s),
          _ => None,
        })
        .collect();
      if !subsystems.is_empty() && !subsystems.iter().any(|s| device.subsystem.as_ref() == Some(*s)) {
        return false;
      }

      let properties: Vec<_> = rules
        .iter()
        .filter_map(|r| match r {
          OwnedMatch::Property(k, v) => Some((k, v)),
          _ => None,
        })
        .collect();
      let all_properties = device.all_properties(None);
      if !properties.is_empty()
        && !properties
          .iter()
          .any(|(k, v)| all_properties.get(*k) == Some(*v))
      {
        return false;
      }

      let sysnames: Vec<_> = rules
        .iter()
        .filter_map(|r| match r {
          OwnedMatch::SysName(n) => Some(n),
          _ => None,
        })
        .collect();
      if !sysnames.is_empty() && !sysnames.iter().any(|n| device.sysname() == n.as_str()) {
        return false;
      }

      rules.iter().all(|rule| match rule {
        OwnedMatch::NoSubsystem(s) => device.subsystem.as_ref() != Some(s),
        OwnedMatch::SysAttr(n, v) => match (device.attributes.get(n), v) {
          (Some(actual), Some(expected)) => actual == expected,
          (Some(_), None) => true,
          (None, _) => false,
        },
        OwnedMatch::NoSysAttr(n, v) => match (device.attributes.get(n), v) {
          (Some(actual), Some(expected)) => actual != expected,
          (Some(_), None) => false,
          (None, _) => true,
        },
        OwnedMatch::Tag(t) => device.tags.contains(t),
        OwnedMatch::Parent(p) => {
          device.devpath == *p || device.devpath.starts_with(&format!("{}/", p))
        }
        OwnedMatch::IsInitialized => device.initialized,
        OwnedMatch::Subsystem(_) | OwnedMatch::Property(..) | OwnedMatch::SysName(_) => true,
      })
    };

    Ok(
      state
        .devices
        .values()
        .filter(|d| matches(d))
        .map(|d| format!("{}{}", SYS_ROOT, d.devpath))
        .collect(),
    )
  }

  fn monitor_new_from_netlink(&self, context: RawHandle, source: &CStr) -> Option<RawHandle> {
    let mut state = self.lock();
    state.entry(context);
    if state.fail_allocation {
      return None;
    }
    assert!(
      matches!(source.to_bytes(), b"udev" | b"kernel"),
      "unexpected netlink source {:?}",
      source
    );
    let (reader, writer) = UnixDatagram::pair().ok()?;
    let monitor = FakeMonitor {
      reader,
      writer,
      queue: VecDeque::new(),
      pending: Vec::new(),
      committed: Vec::new(),
      receiving: false,
    };
    Some(state.insert(HandleClass::Monitor, Object::Monitor(Box::new(monitor))))
  }

  fn monitor_enable_receiving(&self, monitor: RawHandle) -> io::Result<()> {
    let mut state = self.lock();
    let monitor = state.monitor(monitor);
    monitor.reader.set_nonblocking(true)?;
    monitor.receiving = true;
    Ok(())
  }

  fn monitor_set_receive_buffer_size(&self, monitor: RawHandle, size: i32) -> io::Result<()> {
    let mut state = self.lock();
    state.monitor(monitor);
    if !state.privileged {
      return Err(io::Error::from_raw_os_error(libc::EPERM));
    }
    state.buffer_size = Some(size);
    Ok(())
  }

  fn monitor_fd(&self, monitor: RawHandle) -> RawFd {
    self.lock().monitor(monitor).reader.as_raw_fd()
  }

  fn monitor_receive_device(&self, monitor: RawHandle) -> io::Result<RawHandle> {
    let mut state = self.lock();
    if state.interrupts > 0 {
      state.interrupts -= 1;
      return Err(io::ErrorKind::Interrupted.into());
    }

    let monitor = state.monitor(monitor);
    let mut byte = [0u8; 1];
    if monitor.reader.recv(&mut byte)? == 0 {
      return Err(io::ErrorKind::WouldBlock.into());
    }
    let (record, action) = monitor
      .queue
      .pop_front()
      .ok_or_else(|| io::Error::from(io::ErrorKind::WouldBlock))?;

    state.seqnum += 1;
    let seqnum = state.seqnum;
    Ok(state.new_device(record, Some(action), seqnum))
  }

  fn monitor_filter_add_match_subsystem_devtype(
    &self,
    monitor: RawHandle,
    subsystem: &CStr,
    devtype: Option<&CStr>,
  ) -> io::Result<()> {
    let mut state = self.lock();
    let rule = Rule::Subsystem(text(subsystem), devtype.map(text));
    state.monitor(monitor).pending.push(rule);
    Ok(())
  }

  fn monitor_filter_add_match_tag(&self, monitor: RawHandle, tag: &CStr) -> io::Result<()> {
    let mut state = self.lock();
    state.monitor(monitor).pending.push(Rule::Tag(text(tag)));
    Ok(())
  }

  fn monitor_filter_update(&self, monitor: RawHandle) -> io::Result<()> {
    let mut state = self.lock();
    let monitor = state.monitor(monitor);
    monitor.committed = monitor.pending.clone();
    Ok(())
  }

  fn monitor_filter_remove(&self, monitor: RawHandle) -> io::Result<()> {
    let mut state = self.lock();
    state.monitor(monitor).committed.clear();
    Ok(())
  }
}
