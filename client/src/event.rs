// Copyright (C) 2019  Pierre Krieger
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <https://www.gnu.org/licenses/>.

//! Auto-reset event used to wait for out-of-band notifications.

use parking_lot::{Condvar, Mutex};
use std::time::{Duration, Instant};

/// Auto-reset event that can additionally be interrupted.
///
/// Signals and interruptions that happen while nobody waits are remembered, and the next call to
/// [`Event::wait`] returns immediately.
#[derive(Debug, Default)]
pub struct Event {
    state: Mutex<State>,
    condvar: Condvar,
}

#[derive(Debug, Default)]
struct State {
    signaled: bool,
    interrupted: bool,
    /// If true, every wait returns [`Wakeup::Closed`].
    closed: bool,
}

/// Reason why [`Event::wait`] returned.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Wakeup {
    Signaled,
    /// [`Event::interrupt`] has been called.
    Interrupted,
    /// [`Event::close`] has been called.
    Closed,
    TimedOut,
}

impl Event {
    pub fn new() -> Event {
        Event::default()
    }

    /// Wakes up the waiter, or the next one if nobody is waiting.
    pub fn signal(&self) {
        let mut state = self.state.lock();
        state.signaled = true;
        self.condvar.notify_one();
    }

    /// Makes the current or next wait return [`Wakeup::Interrupted`].
    pub fn interrupt(&self) {
        let mut state = self.state.lock();
        state.interrupted = true;
        self.condvar.notify_all();
    }

    /// Makes all current and future waits return [`Wakeup::Closed`].
    pub fn close(&self) {
        let mut state = self.state.lock();
        state.closed = true;
        self.condvar.notify_all();
    }

    /// Blocks until the event is signaled, interrupted or closed, or until `timeout` has elapsed.
    /// `None` means no timeout.
    pub fn wait(&self, timeout: Option<Duration>) -> Wakeup {
        let deadline = timeout.and_then(|t| Instant::now().checked_add(t));
        let mut state = self.state.lock();

        loop {
            if state.closed {
                return Wakeup::Closed;
            }
            if state.interrupted {
                state.interrupted = false;
                return Wakeup::Interrupted;
            }
            if state.signaled {
                state.signaled = false;
                return Wakeup::Signaled;
            }

            match deadline {
                Some(deadline) => {
                    if self.condvar.wait_until(&mut state, deadline).timed_out()
                        && !state.closed
                        && !state.interrupted
                        && !state.signaled
                    {
                        return Wakeup::TimedOut;
                    }
                }
                None => self.condvar.wait(&mut state),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{Event, Wakeup};
    use std::{sync::Arc, thread, time::Duration};

    #[test]
    fn remembers_signal() {
        let event = Event::new();
        event.signal();
        assert_eq!(event.wait(Some(Duration::from_millis(0))), Wakeup::Signaled);
        assert_eq!(event.wait(Some(Duration::from_millis(10))), Wakeup::TimedOut);
    }

    #[test]
    fn interrupt_is_one_shot() {
        let event = Event::new();
        event.interrupt();
        assert_eq!(event.wait(None), Wakeup::Interrupted);
        assert_eq!(event.wait(Some(Duration::from_millis(10))), Wakeup::TimedOut);
    }

    #[test]
    fn close_is_latched() {
        let event = Event::new();
        event.signal();
        event.close();
        assert_eq!(event.wait(None), Wakeup::Closed);
        assert_eq!(event.wait(None), Wakeup::Closed);
    }

    #[test]
    fn wakes_blocked_thread() {
        let event = Arc::new(Event::new());
        let waiter = {
            let event = event.clone();
            thread::spawn(move || event.wait(Some(Duration::from_secs(30))))
        };
        thread::sleep(Duration::from_millis(50));
        event.interrupt();
        assert_eq!(waiter.join().unwrap(), Wakeup::Interrupted);
    }
}
