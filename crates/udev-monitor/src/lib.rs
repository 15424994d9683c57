//! Device event monitoring on top of the native device library.
//!
//! [`Device`] wraps a reference-counted native device, [`Monitor`] receives
//! device events from netlink and [`MonitorObserver`] delivers them to a
//! callback on a background thread. [`EventStream`] exposes the same events
//! as an async [`futures::Stream`].

mod config;
mod context;
mod device;
mod enumerate;
mod monitor;
mod observer;
mod pipe;
mod poll;
mod stream;

pub mod native;

pub use config::{ConfigError, ConfigFormat, FormatError, MonitorConfig, SubsystemFilter};
pub use context::Context;
pub use device::{Action, Ancestors, Device, DeviceError};
pub use enumerate::Enumerator;
pub use monitor::{EventSource, Monitor, MonitorError};
pub use native::DeviceKind;
pub use observer::{MonitorObserver, ObserverError, ObserverState, StopHandle};
pub use pipe::{Pipe, PipeSink, PipeSource};
pub use poll::{Poll, PollError, Readiness};
pub use stream::EventStream;
