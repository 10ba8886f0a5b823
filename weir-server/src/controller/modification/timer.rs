//! The deadline timer: a dedicated thread that fires expiry callbacks for
//! modifications that outlive their timeout.
//!
//! Cancellation is cooperative. A modification's terminal transition flips
//! its [`DeadlineHandle`](super::pending::DeadlineHandle); the timer fires
//! regardless, and the expiry callback re-checks the modification's state
//! under the coordinator lock before doing anything. That keeps the timer
//! thread free of any locking of its own.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use slog::Logger;
use weir::ModificationId;

enum TimerOp {
    Schedule {
        fire_at: Instant,
        modification: ModificationId,
    },
    Shutdown,
}

pub(crate) struct DeadlineTimer {
    tx: mpsc::Sender<TimerOp>,
    handle: Option<JoinHandle<()>>,
}

impl DeadlineTimer {
    /// Spawn the timer thread. `on_expiry` runs on that thread for every
    /// deadline that fires.
    pub(crate) fn new<F>(on_expiry: F, log: Logger) -> Self
    where
        F: Fn(ModificationId) + Send + 'static,
    {
        let (tx, rx) = mpsc::channel();
        let handle = thread::Builder::new()
            .name("modification-timer".to_owned())
            .spawn(move || {
                let mut deadlines: BinaryHeap<Reverse<(Instant, ModificationId)>> =
                    BinaryHeap::new();
                loop {
                    // fire everything that is due
                    let now = Instant::now();
                    while deadlines
                        .peek()
                        .map(|&Reverse((at, _))| at <= now)
                        .unwrap_or(false)
                    {
                        let Reverse((_, modification)) = deadlines.pop().unwrap();
                        trace!(log, "deadline fired"; "modification" => %modification);
                        on_expiry(modification);
                    }

                    let timeout = deadlines
                        .peek()
                        .map(|&Reverse((at, _))| at.saturating_duration_since(Instant::now()))
                        .unwrap_or_else(|| Duration::from_secs(3600));

                    match rx.recv_timeout(timeout) {
                        Ok(TimerOp::Schedule {
                            fire_at,
                            modification,
                        }) => {
                            deadlines.push(Reverse((fire_at, modification)));
                        }
                        Ok(TimerOp::Shutdown) | Err(RecvTimeoutError::Disconnected) => break,
                        Err(RecvTimeoutError::Timeout) => (),
                    }
                }
            })
            .unwrap();

        DeadlineTimer {
            tx,
            handle: Some(handle),
        }
    }

    pub(crate) fn schedule(&self, modification: ModificationId, delay: Duration) {
        // the timer thread outlives every caller except shutdown, where
        // firing late is harmless anyway
        let _ = self.tx.send(TimerOp::Schedule {
            fire_at: Instant::now() + delay,
            modification,
        });
    }
}

impl Drop for DeadlineTimer {
    fn drop(&mut self) {
        let _ = self.tx.send(TimerOp::Shutdown);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    fn log() -> Logger {
        Logger::root(slog::Discard, o!())
    }

    #[test]
    fn fires_due_deadlines_in_order() {
        let fired = Arc::new(Mutex::new(Vec::new()));
        let sink = fired.clone();
        let timer = DeadlineTimer::new(
            move |m| sink.lock().unwrap().push(m),
            log(),
        );

        timer.schedule(ModificationId::from(2), Duration::from_millis(40));
        timer.schedule(ModificationId::from(1), Duration::from_millis(10));

        thread::sleep(Duration::from_millis(200));
        assert_eq!(
            *fired.lock().unwrap(),
            vec![ModificationId::from(1), ModificationId::from(2)]
        );
    }

    #[test]
    fn shutdown_joins_the_thread() {
        let timer = DeadlineTimer::new(|_| (), log());
        timer.schedule(ModificationId::from(1), Duration::from_secs(1000));
        drop(timer);
        // reaching this point without hanging is the assertion
    }
}
