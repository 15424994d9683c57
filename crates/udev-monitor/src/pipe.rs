//! A non-blocking self-pipe used to wake the observer's worker.

use std::{
  fs::File,
  io::{self, Write},
  os::unix::io::{AsRawFd, FromRawFd, RawFd},
};

/// Read end. Dropping it closes the descriptor.
#[derive(Debug)]
pub struct PipeSource(File);

/// Write end.
#[derive(Debug)]
pub struct PipeSink(File);

#[derive(Debug)]
pub struct Pipe {
  pub source: PipeSource,
  pub sink: PipeSink,
}

impl Pipe {
  /// Opens a pipe with both ends non-blocking and close-on-exec.
  pub fn open() -> io::Result<Self> {
    let mut fds = [0 as RawFd; 2];
    if unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_NONBLOCK | libc::O_CLOEXEC) } < 0 {
      return Err(io::Error::last_os_error());
    }

    // SAFETY: both descriptors were just opened and are owned by nobody else.
    let (source, sink) = unsafe { (File::from_raw_fd(fds[0]), File::from_raw_fd(fds[1])) };
    Ok(Self {
      source: PipeSource(source),
      sink: PipeSink(sink),
    })
  }
}

impl AsRawFd for PipeSource {
  fn as_raw_fd(&self) -> RawFd {
    self.0.as_raw_fd()
  }
}

impl PipeSink {
  /// Writes a single byte and closes the write end.
  ///
  /// A reader that is already gone counts as signalled.
  pub fn signal(mut self) -> io::Result<()> {
    match self.0.write_all(&[1]).and_then(|()| self.0.flush()) {
      Err(e) if e.raw_os_error() == Some(libc::EPIPE) => Ok(()),
      result => result,
    }
  }
}

impl AsRawFd for PipeSink {
  fn as_raw_fd(&self) -> RawFd {
    self.0.as_raw_fd()
  }
}
