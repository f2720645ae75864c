use std::{
    sync::{Arc, Condvar, Mutex},
    time::{Duration, Instant},
};

use derive_more::{Deref, Display};
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use super::QueueError;
use crate::loom::category;

#[derive(Debug, Default, Display, Clone, Copy, PartialEq, Eq, Hash, Deref)]
pub struct EventId(uid::Id<EventId>);

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct EventOptions {
    /// Record the time at which the event is signaled.
    pub timing: bool,
}

impl EventOptions {
    #[inline]
    pub fn timing() -> Self {
        Self { timing: true }
    }
}

#[derive(Debug, Default)]
struct EventState {
    occurred: bool,
    recorded: Option<Instant>,
}

#[derive(Debug)]
struct EventInner {
    id: EventId,
    options: EventOptions,
    timeout: Option<Duration>,
    state: Mutex<EventState>,
    condvar: Condvar,
    notify: tokio::sync::Notify,
}

/// A one-shot completion signal used to order work within and across queues.
///
/// Once signaled an event stays signaled. Clones share the same signal.
#[derive(Debug, Clone)]
pub struct QueueEvent(Arc<EventInner>);

impl QueueEvent {
    pub(crate) fn new(options: EventOptions, timeout: Option<Duration>) -> Self {
        let id = EventId::default();
        let inner = EventInner {
            id,
            options,
            timeout,
            state: Default::default(),
            condvar: Condvar::new(),
            notify: tokio::sync::Notify::new(),
        };
        Self(Arc::new(inner))
    }

    #[inline]
    pub fn id(&self) -> EventId {
        self.0.id
    }

    #[inline]
    pub fn options(&self) -> EventOptions {
        self.0.options
    }

    #[inline]
    pub fn timeout(&self) -> Option<Duration> {
        self.0.timeout
    }

    #[inline]
    pub fn occurred(&self) -> bool {
        self.0.state.lock().expect("failed to lock").occurred
    }

    /// The time the event was signaled, if timing was requested.
    #[inline]
    pub fn recorded_time(&self) -> Option<Instant> {
        self.0.state.lock().expect("failed to lock").recorded
    }

    pub(crate) fn signal(&self) {
        {
            let mut state = self.0.state.lock().expect("failed to lock");
            if state.occurred {
                return;
            }
            if self.0.options.timing {
                state.recorded = Some(Instant::now());
            }
            state.occurred = true;
        }
        log::trace!(target: category::QUEUE_SYNC, "signal QueueEvent({})", self.id());
        self.0.condvar.notify_all();
        self.0.notify.notify_waiters();
    }

    /// Blocks the calling thread until the event is signaled.
    ///
    /// Returns immediately if the event has already occurred.
    /// Fails with [`QueueError::Timeout`] if the event's timeout elapses first.
    pub fn wait(&self) -> Result<(), QueueError> {
        let state = self.0.state.lock().expect("failed to lock");
        if state.occurred {
            return Ok(());
        }
        match self.0.timeout {
            Some(timeout) => {
                let (_state, result) = self
                    .0
                    .condvar
                    .wait_timeout_while(state, timeout, |state| !state.occurred)
                    .expect("failed to lock");
                if result.timed_out() {
                    log::warn!(
                        target: category::QUEUE_SYNC,
                        "timeout QueueEvent({}) after {timeout:?}",
                        self.id()
                    );
                    return Err(QueueError::Timeout(timeout));
                }
            }
            None => {
                let _state = self
                    .0
                    .condvar
                    .wait_while(state, |state| !state.occurred)
                    .expect("failed to lock");
            }
        }
        Ok(())
    }

    /// Suspends the calling task until the event is signaled.
    pub async fn wait_async(&self) -> Result<(), QueueError> {
        let notified = self.0.notify.notified();
        let mut notified = std::pin::pin!(notified);
        // register before checking, so a signal in between is not lost
        notified.as_mut().enable();
        if self.occurred() {
            return Ok(());
        }
        match self.0.timeout {
            Some(timeout) => match tokio::time::timeout(timeout, notified).await {
                Ok(()) => Ok(()),
                Err(_) => {
                    log::warn!(
                        target: category::QUEUE_SYNC,
                        "timeout QueueEvent({}) after {timeout:?}",
                        self.id()
                    );
                    Err(QueueError::Timeout(timeout))
                }
            },
            None => {
                notified.await;
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{error::Error, time::Duration};

    use super::{EventOptions, QueueEvent};
    use crate::loom::device::QueueError;

    #[test]
    fn test_signal_wait() -> Result<(), Box<dyn Error>> {
        let event = QueueEvent::new(EventOptions::timing(), None);
        assert!(!event.occurred());
        assert!(event.recorded_time().is_none());

        let signal = event.clone();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(10));
            signal.signal();
        });
        event.wait()?;
        assert!(event.occurred());
        assert!(event.recorded_time().is_some());

        // waiting again returns immediately
        event.wait()?;
        handle.join().expect("failed to join");
        Ok(())
    }

    #[test]
    fn test_timeout() {
        let timeout = Duration::from_millis(10);
        let event = QueueEvent::new(EventOptions::default(), Some(timeout));
        match event.wait() {
            Err(QueueError::Timeout(t)) => assert_eq!(t, timeout),
            other => panic!("expected timeout, got {other:?}"),
        }
        assert!(!event.occurred());
    }

    #[tokio::test]
    async fn test_wait_async() -> Result<(), Box<dyn Error>> {
        let event = QueueEvent::new(EventOptions::default(), Some(Duration::from_secs(5)));
        let signal = event.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            signal.signal();
        });
        event.wait_async().await?;
        assert!(event.occurred());

        let event = QueueEvent::new(EventOptions::default(), Some(Duration::from_millis(10)));
        assert!(matches!(
            event.wait_async().await,
            Err(QueueError::Timeout(_))
        ));
        Ok(())
    }
}
