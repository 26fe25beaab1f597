//! Named background thread running a callback on a fixed period.

use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{after, bounded, select, tick, Sender};

use crate::domain::WatchdogError;

/// Periodic task on its own thread. Stopping (or dropping) signals the
/// thread and joins it.
#[derive(Debug)]
pub struct ScanTimer {
    name: String,
    shutdown: Option<Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl ScanTimer {
    /// Run `task` every `interval`, the first time after `initial_delay`.
    ///
    /// # Errors
    /// [`WatchdogError::SpawnFailed`] if the thread cannot be created.
    pub fn spawn<F>(
        name: &str,
        initial_delay: Duration,
        interval: Duration,
        mut task: F,
    ) -> Result<Self, WatchdogError>
    where
        F: FnMut() + Send + 'static,
    {
        let (shutdown_tx, shutdown_rx) = bounded::<()>(1);
        let thread_name = name.to_string();

        let handle = thread::Builder::new()
            .name(thread_name.clone())
            .spawn(move || {
                log::debug!("{thread_name} started");
                select! {
                    recv(shutdown_rx) -> _ => return,
                    recv(after(initial_delay)) -> _ => {}
                }
                let ticker = tick(interval);
                task();
                loop {
                    select! {
                        recv(shutdown_rx) -> _ => break,
                        recv(ticker) -> _ => task(),
                    }
                }
                log::debug!("{thread_name} stopped");
            })
            .map_err(|e| WatchdogError::SpawnFailed { name: name.to_string(), error: e.to_string() })?;

        Ok(Self { name: name.to_string(), shutdown: Some(shutdown_tx), handle: Some(handle) })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn stop(mut self) {
        self.shutdown_and_join();
    }

    fn shutdown_and_join(&mut self) {
        // Dropping the sender disconnects the channel, which wakes the select
        drop(self.shutdown.take());
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                log::warn!("{} panicked", self.name);
            }
        }
    }
}

impl Drop for ScanTimer {
    fn drop(&mut self) {
        self.shutdown_and_join();
    }
}
