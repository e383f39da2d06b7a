//! One-shot synchronization events used to fence asynchronous runs.

use std::fmt;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use crate::error::{OnnxXlaError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventState {
    NonSignalled,
    Signalled,
}

#[derive(Default)]
struct EventInner {
    signalled: Mutex<bool>,
    condvar: Condvar,
}

/// Event that moves from non-signalled to signalled exactly once.
///
/// Clones share state, so one side can signal while another waits.
#[derive(Clone, Default)]
pub struct Event {
    inner: Arc<EventInner>,
}

impl Event {
    pub fn new() -> Self {
        Self::default()
    }

    /// An event that is already signalled, for runs whose inputs are ready.
    pub fn signalled() -> Self {
        let event = Self::new();
        *event.lock() = true;
        event
    }

    pub fn state(&self) -> EventState {
        if *self.lock() {
            EventState::Signalled
        } else {
            EventState::NonSignalled
        }
    }

    /// Signals the event and wakes every waiter. Signalling twice is an error.
    pub fn signal(&self) -> Result<()> {
        {
            let mut signalled = self.lock();
            if *signalled {
                return Err(OnnxXlaError::InvalidState(
                    "event is already signalled".into(),
                ));
            }
            *signalled = true;
        }
        self.inner.condvar.notify_all();
        Ok(())
    }

    /// Blocks until the event is signalled.
    pub fn wait(&self) {
        let signalled = self.lock();
        let _signalled = self
            .inner
            .condvar
            .wait_while(signalled, |signalled| !*signalled)
            .unwrap_or_else(PoisonError::into_inner);
    }

    /// Blocks for at most `timeout`; returns whether the event was signalled.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let signalled = self.lock();
        let (signalled, _) = self
            .inner
            .condvar
            .wait_timeout_while(signalled, timeout, |signalled| !*signalled)
            .unwrap_or_else(PoisonError::into_inner);
        *signalled
    }

    fn lock(&self) -> MutexGuard<'_, bool> {
        self.inner
            .signalled
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

impl fmt::Debug for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Event").field("state", &self.state()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signal_is_one_shot() {
        let event = Event::new();
        assert_eq!(event.state(), EventState::NonSignalled);
        event.signal().unwrap();
        assert_eq!(event.state(), EventState::Signalled);
        assert!(matches!(event.signal(), Err(OnnxXlaError::InvalidState(_))));
        assert_eq!(Event::signalled().state(), EventState::Signalled);
    }

    #[test]
    fn waiters_wake_on_signal_from_another_thread() {
        let event = Event::new();
        assert!(!event.wait_timeout(Duration::from_millis(5)));

        let signaller = event.clone();
        let handle = std::thread::spawn(move || signaller.signal());
        event.wait();
        handle.join().unwrap().unwrap();
        assert!(event.wait_timeout(Duration::ZERO));
    }
}
