//! Runs a [`Monitor`] on a background thread and hands every received
//! device to a callback.
//!
//! The worker waits on the monitor descriptor and the read end of a
//! self-pipe. Stopping writes a byte to the pipe, which wakes the worker
//! without any polling interval, and joining it guarantees that the callback
//! is not running anymore once [`MonitorObserver::stop`] returns.

use crate::{
  device::Device,
  monitor::{Monitor, MonitorError},
  pipe::{Pipe, PipeSink, PipeSource},
  poll::{Poll, PollError, Readiness},
};
use std::{
  fmt, io, mem,
  os::unix::io::{AsRawFd, RawFd},
  sync::{Arc, Mutex, MutexGuard, PoisonError, Weak},
  thread::{self, JoinHandle, ThreadId},
  time::Duration,
};
use thiserror::Error;
use tracing::{event, Level};

const THREAD_NAME: &str = "udev-monitor-observer";

#[derive(Debug, Error)]
pub enum ObserverError {
  #[error(transparent)]
  Monitor(#[from] MonitorError),

  #[error(transparent)]
  Poll(#[from] PollError),

  #[error("Unexpected {readiness:?} on monitor descriptor {fd}")]
  UnexpectedReadiness { fd: RawFd, readiness: Readiness },

  #[error("Failed to signal the observer thread")]
  Pipe(#[source] io::Error),

  #[error("Failed to spawn the observer thread")]
  Spawn(#[source] io::Error),

  #[error("Observer callback panicked")]
  WorkerPanicked,

  #[error("The monitor was lost when the observer callback panicked")]
  MonitorLost,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ObserverState {
  Idle,
  Running,
  /// A stop was requested but the worker has not exited yet.
  Stopping,
  Stopped,
}

type Callback = Box<dyn FnMut(Device) + Send>;
type ErrorHandler = Box<dyn FnMut(ObserverError) + Send>;

struct Worker {
  monitor: Monitor,
  callback: Callback,
  error_handler: Option<ErrorHandler>,
}

impl Worker {
  fn run(&mut self, source: PipeSource) -> Result<(), ObserverError> {
    self.monitor.start()?;
    let monitor_fd = self.monitor.as_raw_fd();
    let stop_fd = source.as_raw_fd();
    let mut poll = Poll::for_events(vec![monitor_fd, stop_fd]);

    loop {
      let ready = poll.poll(None)?;
      if ready.iter().any(|(fd, _)| *fd == stop_fd) {
        return Ok(());
      }

      for (fd, readiness) in ready {
        match readiness {
          Readiness::Readable => {
            while let Some(device) = self.monitor.poll(Some(Duration::ZERO))? {
              (self.callback)(device);
            }
          }
          readiness => return Err(ObserverError::UnexpectedReadiness { fd, readiness }),
        }
      }
    }
  }
}

enum Slot {
  Parked(Worker),
  Running(JoinHandle<Worker>),
  Lost,
}

struct Shared {
  slot: Mutex<Slot>,
  sink: Mutex<Option<PipeSink>>,
  worker_thread: Mutex<Option<ThreadId>>,
  state: Mutex<ObserverState>,
  error: Mutex<Option<ObserverError>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
  mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Shared {
  fn start(self: &Arc<Self>) -> Result<(), ObserverError> {
    let mut slot = lock(&self.slot);
    if *lock(&self.state) == ObserverState::Running {
      return Ok(());
    }

    let Pipe { source, sink } = Pipe::open().map_err(ObserverError::Pipe)?;
    let worker = match mem::replace(&mut *slot, Slot::Lost) {
      Slot::Parked(worker) => worker,
      Slot::Running(handle) => match handle.join() {
        Ok(worker) => worker,
        Err(_) => return Err(ObserverError::MonitorLost),
      },
      Slot::Lost => return Err(ObserverError::MonitorLost),
    };

    *lock(&self.sink) = Some(sink);

    // held until the id is recorded, so a callback that stops the observer
    // right away still recognizes its own thread
    let mut worker_thread = lock(&self.worker_thread);
    *lock(&self.state) = ObserverState::Running;

    let shared = self.clone();
    let spawned = thread::Builder::new()
      .name(THREAD_NAME.into())
      .spawn(move || work(worker, source, shared));

    match spawned {
      Ok(handle) => {
        *worker_thread = Some(handle.thread().id());
        *slot = Slot::Running(handle);
        event!(target: "udev-monitor", Level::DEBUG, "started monitor observer");
        Ok(())
      }
      Err(e) => {
        *lock(&self.state) = ObserverState::Stopped;
        lock(&self.sink).take();
        Err(ObserverError::Spawn(e))
      }
    }
  }

  fn on_worker_thread(&self) -> bool {
    *lock(&self.worker_thread) == Some(thread::current().id())
  }

  fn send_stop(&self) -> Result<(), ObserverError> {
    let sink = match lock(&self.sink).take() {
      Some(sink) => sink,
      None => return Ok(()),
    };

    {
      let mut state = lock(&self.state);
      if *state == ObserverState::Running {
        *state = ObserverState::Stopping;
      }
    }

    event!(target: "udev-monitor", Level::DEBUG, "stopping monitor observer");
    sink.signal().map_err(ObserverError::Pipe)
  }

  fn stop(&self) -> Result<(), ObserverError> {
    let sent = self.send_stop();
    if self.on_worker_thread() {
      return sent;
    }

    let mut slot = lock(&self.slot);
    if let Slot::Running(_) = &*slot {
      if let Slot::Running(handle) = mem::replace(&mut *slot, Slot::Lost) {
        match handle.join() {
          Ok(worker) => *slot = Slot::Parked(worker),
          Err(_) => {
            event!(target: "udev-monitor", Level::ERROR, "monitor observer callback panicked");
            *lock(&self.state) = ObserverState::Stopped;
            return Err(ObserverError::WorkerPanicked);
          }
        }
      }
    }

    {
      let mut state = lock(&self.state);
      if *state != ObserverState::Idle {
        *state = ObserverState::Stopped;
      }
    }

    sent?;
    match lock(&self.error).take() {
      Some(e) => Err(e),
      None => Ok(()),
    }
  }
}

fn work(mut worker: Worker, source: PipeSource, shared: Arc<Shared>) -> Worker {
  if let Err(e) = worker.run(source) {
    event!(target: "udev-monitor", Level::ERROR, error = %e, "monitor observer stopped on error");
    match worker.error_handler.as_mut() {
      Some(handler) => handler(e),
      None => *lock(&shared.error) = Some(e),
    }
  }

  *lock(&shared.state) = ObserverState::Stopped;
  worker
}

/// Observes a monitor on a background thread.
///
/// ```no_run
/// # use udev_monitor::{Context, Monitor, MonitorObserver};
/// # fn run(context: &Context) -> Result<(), Box<dyn std::error::Error>> {
/// let mut monitor = Monitor::from_netlink(context, "udev")?;
/// monitor.filter_by("input", None)?;
///
/// let observer = MonitorObserver::new(monitor, |device| {
///   println!("{:?} {}", device.action(), device);
/// });
/// observer.start()?;
/// // ...
/// observer.stop()?;
/// # Ok(())
/// # }
/// ```
pub struct MonitorObserver {
  shared: Arc<Shared>,
}

impl MonitorObserver {
  pub fn new<F>(monitor: Monitor, callback: F) -> Self
  where
    F: FnMut(Device) + Send + 'static,
  {
    let worker = Worker {
      monitor,
      callback: Box::new(callback),
      error_handler: None,
    };

    Self {
      shared: Arc::new(Shared {
        slot: Mutex::new(Slot::Parked(worker)),
        sink: Mutex::new(None),
        worker_thread: Mutex::new(None),
        state: Mutex::new(ObserverState::Idle),
        error: Mutex::new(None),
      }),
    }
  }

  /// Receives errors that end the worker loop. Without a handler they are
  /// returned by the next [`MonitorObserver::stop`].
  pub fn with_error_handler<F>(self, handler: F) -> Self
  where
    F: FnMut(ObserverError) + Send + 'static,
  {
    if let Slot::Parked(worker) = &mut *lock(&self.shared.slot) {
      worker.error_handler = Some(Box::new(handler));
    }
    self
  }

  /// Starts the worker thread. Does nothing if it is already running, and
  /// restarts a stopped observer with the same monitor.
  pub fn start(&self) -> Result<(), ObserverError> {
    self.shared.start()
  }

  /// Asks the worker to stop without waiting for it.
  pub fn send_stop(&self) -> Result<(), ObserverError> {
    self.shared.send_stop()
  }

  /// Stops the worker and waits for it to exit.
  ///
  /// When called from the callback this only requests the stop, since the
  /// worker cannot wait for itself.
  pub fn stop(&self) -> Result<(), ObserverError> {
    self.shared.stop()
  }

  pub fn state(&self) -> ObserverState {
    *lock(&self.shared.state)
  }

  pub fn is_running(&self) -> bool {
    self.state() == ObserverState::Running
  }

  /// A handle that can stop this observer, including from its own callback.
  pub fn stop_handle(&self) -> StopHandle {
    StopHandle {
      shared: Arc::downgrade(&self.shared),
    }
  }
}

impl fmt::Debug for MonitorObserver {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("MonitorObserver")
      .field("state", &self.state())
      .finish()
  }
}

impl Drop for MonitorObserver {
  fn drop(&mut self) {
    if let Err(e) = self.shared.stop() {
      event!(target: "udev-monitor", Level::WARN, error = %e, "monitor observer stopped with error on drop");
    }
  }
}

/// Stops a [`MonitorObserver`] from anywhere. Does nothing once the
/// observer is dropped.
#[derive(Clone)]
pub struct StopHandle {
  shared: Weak<Shared>,
}

impl StopHandle {
  pub fn send_stop(&self) -> Result<(), ObserverError> {
    match self.shared.upgrade() {
      Some(shared) => shared.send_stop(),
      None => Ok(()),
    }
  }

  pub fn stop(&self) -> Result<(), ObserverError> {
    match self.shared.upgrade() {
      Some(shared) => shared.stop(),
      None => Ok(()),
    }
  }

  pub fn is_running(&self) -> bool {
    self
      .shared
      .upgrade()
      .map_or(false, |shared| *lock(&shared.state) == ObserverState::Running)
  }
}

impl fmt::Debug for StopHandle {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("StopHandle")
      .field("running", &self.is_running())
      .finish()
  }
}
