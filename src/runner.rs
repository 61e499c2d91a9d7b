//! Background thread driving an [`Engine`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Instant;

use tracing::{debug, error, info};

use crate::control::EngineEndpoint;
use crate::engine::Engine;

/// Runs an engine's production loop on a dedicated thread.
///
/// Each period the thread first handles any waiting commands, then runs one
/// [`Engine::tick`], then sleeps until the next deadline. Dropping the runner
/// shuts the thread down.
pub struct EngineRunner {
    shutdown: Arc<AtomicBool>,
    thread: Option<JoinHandle<Engine>>,
}

impl EngineRunner {
    /// Move `engine` onto a new thread and start serving `endpoint`.
    pub fn spawn(engine: Engine, endpoint: EngineEndpoint) -> std::io::Result<Self> {
        let shutdown = Arc::new(AtomicBool::new(false));
        let flag = shutdown.clone();

        let thread = thread::Builder::new()
            .name("strom-engine".into())
            .spawn(move || run(engine, endpoint, &flag))?;

        Ok(Self {
            shutdown,
            thread: Some(thread),
        })
    }

    /// `true` while the production thread is alive.
    pub fn is_running(&self) -> bool {
        self.thread.as_ref().is_some_and(|t| !t.is_finished())
    }

    /// Stop the loop, wait for the thread and hand the engine back.
    ///
    /// Returns `None` if the thread panicked.
    pub fn shutdown(mut self) -> Option<Engine> {
        self.join()
    }

    fn join(&mut self) -> Option<Engine> {
        self.shutdown.store(true, Ordering::Release);
        let thread = self.thread.take()?;
        match thread.join() {
            Ok(engine) => Some(engine),
            Err(_) => {
                error!("engine thread panicked");
                None
            }
        }
    }
}

impl Drop for EngineRunner {
    fn drop(&mut self) {
        self.join();
    }
}

fn run(mut engine: Engine, mut endpoint: EngineEndpoint, shutdown: &AtomicBool) -> Engine {
    let period = engine.config().tick_period;
    info!(?period, "engine thread started");

    let mut deadline = Instant::now();
    while !shutdown.load(Ordering::Acquire) {
        engine.serve(&mut endpoint);
        engine.tick();

        deadline += period;
        let now = Instant::now();
        if deadline > now {
            thread::sleep(deadline - now);
        } else if now - deadline > period {
            // more than a whole period late: don't try to catch up
            debug!(late = ?(now - deadline), "engine thread fell behind, resyncing");
            deadline = now;
        }
    }

    info!(
        ticks = engine.ticks(),
        skipped = engine.skipped_ticks(),
        "engine thread stopped"
    );
    engine
}
