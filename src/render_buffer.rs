//! Trailing-edge debounce between a high-frequency value stream and an
//! expensive render path.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::task::JoinHandle;

type CommitSink<T> = Arc<dyn Fn(T) + Send + Sync>;

struct BufferState<T> {
    latest: Option<T>,
    // Bumped by every update, flush and cancel; a timer commits only if it still matches.
    generation: u64,
}

/// Commits only the last value seen within each `delay` window.
///
/// The sink runs while the internal lock is held, so commits are serialized
/// and never observed out of order. The sink must not call back into the
/// buffer.
pub struct StreamRenderBuffer<T> {
    state: Arc<Mutex<BufferState<T>>>,
    sink: CommitSink<T>,
    pending: Option<JoinHandle<()>>,
}

fn lock<T>(state: &Mutex<BufferState<T>>) -> MutexGuard<'_, BufferState<T>> {
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl<T: Clone + Send + 'static> StreamRenderBuffer<T> {
    pub fn new(sink: impl Fn(T) + Send + Sync + 'static) -> Self {
        Self {
            state: Arc::new(Mutex::new(BufferState {
                latest: None,
                generation: 0,
            })),
            sink: Arc::new(sink),
            pending: None,
        }
    }

    /// Buffers `value`, replacing any pending commit.
    ///
    /// With `immediate` the value is committed before this call returns and
    /// no timer is left behind. Must be called from within a tokio runtime.
    pub fn update(&mut self, value: T, delay: Duration, immediate: bool) {
        self.abort_timer();

        let generation = {
            let mut state = lock(&self.state);
            state.generation += 1;
            state.latest = Some(value.clone());
            if immediate {
                (self.sink)(value);
                return;
            }
            state.generation
        };

        let state = Arc::clone(&self.state);
        let sink = Arc::clone(&self.sink);
        self.pending = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let current = lock(&state);
            if current.generation == generation {
                sink(value);
            }
        }));
    }

    /// Drops any pending commit. The latest value stays readable.
    pub fn cancel(&mut self) {
        self.abort_timer();
        lock(&self.state).generation += 1;
    }

    pub fn latest(&self) -> Option<T> {
        lock(&self.state).latest.clone()
    }

    pub fn has_pending(&self) -> bool {
        self.pending
            .as_ref()
            .map(|handle| !handle.is_finished())
            .unwrap_or(false)
    }

    fn abort_timer(&mut self) {
        if let Some(handle) = self.pending.take() {
            handle.abort();
        }
    }
}

impl<T> Drop for StreamRenderBuffer<T> {
    fn drop(&mut self) {
        if let Some(handle) = self.pending.take() {
            handle.abort();
        }
        lock(&self.state).generation += 1;
    }
}
