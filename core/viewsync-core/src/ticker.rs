//! Background interval threads (debounce flusher, polling fallback).

use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

type StopSignal = Arc<(Mutex<bool>, Condvar)>;

/// Handle to a background thread running a closure on an interval.
/// Dropping it stops the thread.
pub struct Ticker {
    stop: StopSignal,
    join: Option<JoinHandle<()>>,
}

impl Ticker {
    pub fn spawn<F>(name: &str, interval: Duration, mut tick: F) -> std::io::Result<Self>
    where
        F: FnMut() + Send + 'static,
    {
        let stop: StopSignal = Arc::new((Mutex::new(false), Condvar::new()));
        let signal = Arc::clone(&stop);
        let join = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || loop {
                if wait_for_stop(&signal, interval) {
                    break;
                }
                tick();
            })?;
        Ok(Self {
            stop,
            join: Some(join),
        })
    }

    /// Signal the thread to stop and wait for it to exit.
    pub fn stop(&mut self) {
        self.signal_stop();
        if let Some(join) = self.join.take() {
            // Stopping from inside the tick closure must not self-join.
            if join.thread().id() != thread::current().id() {
                let _ = join.join();
            }
        }
    }

    pub fn signal_stop(&self) {
        let (flag, wake) = &*self.stop;
        *flag.lock().unwrap_or_else(|poisoned| poisoned.into_inner()) = true;
        wake.notify_all();
    }
}

impl Drop for Ticker {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Sleeps up to `interval`; returns true once stop was requested.
fn wait_for_stop(signal: &StopSignal, interval: Duration) -> bool {
    let (flag, wake) = &**signal;
    let deadline = Instant::now() + interval;
    let mut stopped = flag.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    while !*stopped {
        let now = Instant::now();
        if now >= deadline {
            return false;
        }
        stopped = match wake.wait_timeout(stopped, deadline - now) {
            Ok((guard, _)) => guard,
            Err(poisoned) => poisoned.into_inner().0,
        };
    }
    true
}
