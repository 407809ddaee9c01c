//! Grace-time reaper.
//!
//! Every strapped container gets a countdown of its configured grace time.
//! When it runs out the container is handed to the detonate callback.
//! Pausing cancels the countdown; unpausing starts a fresh one of the full
//! grace time.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use garden::{Container, GraceTime};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Called with the container whose grace time elapsed.
pub type Detonator<C> = Arc<dyn Fn(C) + Send + Sync>;

struct Strap<C> {
    container: C,
    grace: Duration,
    /// Identifies the countdown currently allowed to detonate.
    generation: u64,
    timer: Option<CancellationToken>,
}

impl<C> Strap<C> {
    fn disarm(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.cancel();
        }
    }
}

struct Straps<C> {
    map: Mutex<HashMap<String, Strap<C>>>,
    generations: AtomicU64,
}

impl<C> Straps<C> {
    fn lock(&self) -> MutexGuard<'_, HashMap<String, Strap<C>>> {
        self.map.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Remove the strap if `generation` is still its armed countdown.
    fn take_expired(&self, handle: &str, generation: u64) -> Option<C> {
        let mut map = self.lock();
        match map.get(handle) {
            Some(strap) if strap.generation == generation && strap.timer.is_some() => {
                map.remove(handle).map(|strap| strap.container)
            }
            _ => None,
        }
    }
}

/// Per-container countdowns to destruction.
///
/// Must be used within a Tokio runtime: arming a countdown spawns a task.
pub struct Bomberman<C: Container> {
    backend: Arc<dyn GraceTime<C>>,
    detonate: Detonator<C>,
    straps: Arc<Straps<C>>,
}

impl<C: Container> Bomberman<C> {
    pub fn new(backend: Arc<dyn GraceTime<C>>, detonate: Detonator<C>) -> Self {
        Self {
            backend,
            detonate,
            straps: Arc::new(Straps {
                map: Mutex::new(HashMap::new()),
                generations: AtomicU64::new(0),
            }),
        }
    }

    /// Start counting down `container`'s grace time.
    ///
    /// A zero grace time registers the container without ever arming it.
    /// Strapping an already strapped handle replaces its countdown.
    pub fn strap(&self, container: C) {
        let grace = self.backend.grace_time(&container);
        let handle = container.handle().to_string();
        let mut map = self.straps.lock();
        if let Some(mut old) = map.remove(&handle) {
            old.disarm();
        }
        let strap = map.entry(handle.clone()).or_insert(Strap {
            container,
            grace,
            generation: 0,
            timer: None,
        });
        self.arm(&handle, strap);
    }

    /// Cancel the countdown. The container stays registered.
    pub fn pause(&self, handle: &str) {
        if let Some(strap) = self.straps.lock().get_mut(handle) {
            strap.disarm();
            debug!(handle, "grace timer paused");
        }
    }

    /// Start a fresh countdown of the full grace time.
    pub fn unpause(&self, handle: &str) {
        if let Some(strap) = self.straps.lock().get_mut(handle) {
            strap.disarm();
            self.arm(handle, strap);
        }
    }

    /// Cancel for good and forget the handle.
    pub fn defuse(&self, handle: &str) {
        if let Some(mut strap) = self.straps.lock().remove(handle) {
            strap.disarm();
            debug!(handle, "grace timer defused");
        }
    }

    /// Whether a countdown is running for `handle`.
    pub fn is_armed(&self, handle: &str) -> bool {
        self.straps
            .lock()
            .get(handle)
            .is_some_and(|strap| strap.timer.is_some())
    }

    fn arm(&self, handle: &str, strap: &mut Strap<C>) {
        if strap.grace.is_zero() {
            debug!(handle, "no grace time, container never expires");
            return;
        }

        let generation = self.straps.generations.fetch_add(1, Ordering::Relaxed);
        let timer = CancellationToken::new();
        strap.generation = generation;
        strap.timer = Some(timer.clone());

        let grace = strap.grace;
        let straps = Arc::clone(&self.straps);
        let detonate = Arc::clone(&self.detonate);
        let handle = handle.to_string();
        debug!(handle = %handle, ?grace, "grace timer armed");
        tokio::spawn(async move {
            tokio::select! {
                _ = timer.cancelled() => {}
                _ = tokio::time::sleep(grace) => {
                    // Detonate outside the lock; the callback may call back in
                    if let Some(container) = straps.take_expired(&handle, generation) {
                        info!(handle = %handle, ?grace, "grace time elapsed, destroying container");
                        detonate(container);
                    }
                }
            }
        });
    }
}
