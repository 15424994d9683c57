use crate::{
  device::Device,
  monitor::Monitor,
  observer::{MonitorObserver, ObserverError},
};
use futures::Stream;
use pin_project::pin_project;
use std::{
  pin::Pin,
  task::{Context, Poll},
};
use tokio::sync::mpsc::{channel, Receiver};

/// Device events as an async stream.
///
/// A [`MonitorObserver`] pushes devices into a bounded channel; when the
/// consumer falls behind, the observer thread waits and the kernel buffers
/// further events. A fatal observer error is yielded once, after which the
/// stream ends. Dropping the stream stops the observer.
#[pin_project]
pub struct EventStream {
  // declared first so it is dropped first, releasing a worker blocked on a
  // full channel before the observer joins it
  #[pin]
  receiver: Receiver<Result<Device, ObserverError>>,
  observer: MonitorObserver,
  done: bool,
}

impl EventStream {
  pub fn new(monitor: Monitor, capacity: usize) -> Result<Self, ObserverError> {
    let (sender, receiver) = channel(capacity.max(1));
    let errors = sender.clone();

    let observer = MonitorObserver::new(monitor, move |device| {
      // the receiver is gone only while the stream is being dropped
      let _ = sender.blocking_send(Ok(device));
    })
    .with_error_handler(move |e| {
      let _ = errors.blocking_send(Err(e));
    });
    observer.start()?;

    Ok(Self {
      receiver,
      observer,
      done: false,
    })
  }

  /// Stops the observer. Items already in the channel can still be read,
  /// after which the stream ends.
  pub fn stop(&mut self) -> Result<(), ObserverError> {
    // a worker blocked on a full channel fails its send and sees the stop
    self.receiver.close();
    self.observer.stop()
  }
}

impl Stream for EventStream {
  type Item = Result<Device, ObserverError>;

  fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
    let mut this = self.project();
    if *this.done {
      return Poll::Ready(None);
    }

    match this.receiver.poll_recv(cx) {
      Poll::Ready(Some(Err(e))) => {
        *this.done = true;
        Poll::Ready(Some(Err(e)))
      }
      other => other,
    }
  }
}
