//! A minimal `poll(2)` wrapper over a fixed set of descriptors.

use std::{
  convert::TryFrom,
  io,
  os::{raw::c_int, unix::io::RawFd},
  time::{Duration, Instant},
};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PollError {
  #[error("Descriptor {0} is not open")]
  InvalidDescriptor(RawFd),

  #[error("Error condition on descriptor {0}")]
  DescriptorError(RawFd),

  #[error(transparent)]
  Io(#[from] io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Readiness {
  Readable,
  HungUp,
}

/// Waits for input on a set of descriptors.
#[derive(Debug)]
pub struct Poll {
  fds: Vec<libc::pollfd>,
}

impl Poll {
  /// Registers every descriptor for input events.
  pub fn for_events(fds: impl IntoIterator<Item = RawFd>) -> Self {
    let fds = fds
      .into_iter()
      .map(|fd| libc::pollfd {
        fd,
        events: libc::POLLIN,
        revents: 0,
      })
      .collect();
    Self { fds }
  }

  /// Waits until at least one descriptor is ready or `timeout` expires.
  ///
  /// `None` waits forever, `Some(Duration::ZERO)` only checks. An empty
  /// result means the timeout expired. Interrupted waits are resumed with
  /// whatever time is left.
  pub fn poll(&mut self, timeout: Option<Duration>) -> Result<Vec<(RawFd, Readiness)>, PollError> {
    let deadline = timeout.map(|timeout| Instant::now() + timeout);
    let mut wait = timeout;

    loop {
      for pfd in self.fds.iter_mut() {
        pfd.revents = 0;
      }

      let rc = unsafe {
        libc::poll(
          self.fds.as_mut_ptr(),
          self.fds.len() as libc::nfds_t,
          timeout_millis(wait),
        )
      };

      if rc >= 0 {
        return self.ready();
      }

      let error = io::Error::last_os_error();
      if error.kind() != io::ErrorKind::Interrupted {
        return Err(error.into());
      }

      if let Some(deadline) = deadline {
        wait = Some(deadline.saturating_duration_since(Instant::now()));
      }
    }
  }

  fn ready(&self) -> Result<Vec<(RawFd, Readiness)>, PollError> {
    let mut ready = Vec::new();
    for pfd in &self.fds {
      let revents = pfd.revents;
      if revents & libc::POLLNVAL != 0 {
        return Err(PollError::InvalidDescriptor(pfd.fd));
      }
      if revents & libc::POLLERR != 0 {
        return Err(PollError::DescriptorError(pfd.fd));
      }
      if revents & libc::POLLIN != 0 {
        ready.push((pfd.fd, Readiness::Readable));
      }
      if revents & libc::POLLHUP != 0 {
        ready.push((pfd.fd, Readiness::HungUp));
      }
    }
    Ok(ready)
  }
}

fn timeout_millis(timeout: Option<Duration>) -> c_int {
  match timeout {
    None => -1,
    Some(timeout) => {
      let mut millis = timeout.as_millis();
      if Duration::from_millis(millis as u64) < timeout {
        millis += 1;
      }
      c_int::try_from(millis).unwrap_or(c_int::MAX)
    }
  }
}
