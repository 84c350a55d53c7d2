use std::{
    sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use bitflags::bitflags;
use log::trace;

use crate::file::File;

bitflags! {
    /// Poll event bits, with the values of `poll(2)`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct PollEvents: libc::c_short {
        const IN = libc::POLLIN;
        const PRI = libc::POLLPRI;
        const OUT = libc::POLLOUT;
        const ERR = libc::POLLERR;
        const HUP = libc::POLLHUP;
        const NVAL = libc::POLLNVAL;
    }
}

impl PollEvents {
    /// Events reported whether they were requested or not.
    pub const ALWAYS: Self = Self::ERR.union(Self::HUP).union(Self::NVAL);
}

impl Default for PollEvents {
    fn default() -> Self {
        Self::empty()
    }
}

/// A party waiting for events on one or more files.
#[derive(Debug)]
pub struct PollWaiter {
    events: PollEvents,
    revents: Mutex<PollEvents>,
    cond: Condvar,
}

impl PollWaiter {
    pub fn new(events: PollEvents) -> Arc<Self> {
        Arc::new(Self {
            events,
            revents: Mutex::new(PollEvents::empty()),
            cond: Condvar::new(),
        })
    }

    /// The events this waiter asked for.
    pub fn events(&self) -> PollEvents {
        self.events
    }

    /// The events delivered so far.
    pub fn revents(&self) -> PollEvents {
        *self.lock()
    }

    /// Blocks until some event is delivered or `timeout` elapses, returning the delivered events.
    pub fn wait(&self, timeout: Option<Duration>) -> PollEvents {
        let revents = self.lock();
        let revents = match timeout {
            Some(timeout) => {
                self.cond
                    .wait_timeout_while(revents, timeout, |revents| revents.is_empty())
                    .unwrap_or_else(PoisonError::into_inner)
                    .0
            }
            None => self
                .cond
                .wait_while(revents, |revents| revents.is_empty())
                .unwrap_or_else(PoisonError::into_inner),
        };
        *revents
    }

    fn notify(&self, revents: PollEvents) {
        *self.lock() |= revents;
        self.cond.notify_all();
    }

    fn lock(&self) -> MutexGuard<'_, PollEvents> {
        self.revents.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl File {
    /// Links `waiter` to the file and returns the events that are already ready.
    ///
    /// Ready events are delivered to the waiter as well.
    pub fn poll_install(&self, waiter: &Arc<PollWaiter>) -> PollEvents {
        self.poll_waiters().push(Arc::clone(waiter));

        let ready = self.poll(waiter.events()) & (waiter.events() | PollEvents::ALWAYS);
        if !ready.is_empty() {
            waiter.notify(ready);
        }
        ready
    }

    /// Unlinks `waiter` from the file.
    pub fn poll_uninstall(&self, waiter: &Arc<PollWaiter>) {
        self.poll_waiters().retain(|linked| !Arc::ptr_eq(linked, waiter));
    }

    /// Delivers `events` to every linked waiter interested in them.
    ///
    /// Called by file types when the file's readiness changes.
    pub fn poll_wake(&self, events: PollEvents) {
        for waiter in self.poll_waiters().iter() {
            let delivered = events & (waiter.events() | PollEvents::ALWAYS);
            if !delivered.is_empty() {
                waiter.notify(delivered);
            }
        }
    }

    /// Number of linked waiters.
    pub fn poll_waiter_count(&self) -> usize {
        self.poll_waiters().len()
    }

    /// Unlinks every waiter, failing each with [PollEvents::NVAL].
    pub(crate) fn poll_drain(&self) {
        let waiters = std::mem::take(&mut *self.poll_waiters());
        trace!("draining {} poll waiters of file {:p}", waiters.len(), self);
        for waiter in waiters {
            waiter.notify(PollEvents::NVAL);
        }
    }

    fn poll_waiters(&self) -> MutexGuard<'_, Vec<Arc<PollWaiter>>> {
        self.poll_list.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
