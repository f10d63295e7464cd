use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::Duration;

/// Latest encoded frame, shared between the pipeline and stream clients.
///
/// Only already-redacted JPEG bytes are ever stored here. Readers wait on a
/// generation counter so a slow client skips frames instead of queueing them.
#[derive(Default)]
pub struct FrameHub {
    state: Mutex<HubState>,
    changed: Condvar,
}

#[derive(Default)]
struct HubState {
    latest: Option<Arc<Vec<u8>>>,
    generation: u64,
    closed: bool,
}

/// What a waiting reader got back.
pub enum HubFrame {
    Frame { generation: u64, jpeg: Arc<Vec<u8>> },
    Timeout,
    Closed,
}

impl FrameHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn publish(&self, jpeg: Vec<u8>) -> u64 {
        let mut state = self.lock();
        state.generation += 1;
        state.latest = Some(Arc::new(jpeg));
        let generation = state.generation;
        drop(state);
        self.changed.notify_all();
        generation
    }

    pub fn latest(&self) -> Option<(u64, Arc<Vec<u8>>)> {
        let state = self.lock();
        state
            .latest
            .as_ref()
            .map(|jpeg| (state.generation, Arc::clone(jpeg)))
    }

    pub fn generation(&self) -> u64 {
        self.lock().generation
    }

    /// Wait for a frame newer than `seen`.
    pub fn wait_newer(&self, seen: u64, timeout: Duration) -> HubFrame {
        let guard = self.lock();
        let (state, _) = match self.changed.wait_timeout_while(guard, timeout, |s| {
            !s.closed && (s.generation <= seen || s.latest.is_none())
        }) {
            Ok(result) => result,
            Err(poisoned) => poisoned.into_inner(),
        };
        if state.closed {
            return HubFrame::Closed;
        }
        match state.latest.as_ref() {
            Some(jpeg) if state.generation > seen => HubFrame::Frame {
                generation: state.generation,
                jpeg: Arc::clone(jpeg),
            },
            _ => HubFrame::Timeout,
        }
    }

    /// Wake every reader and refuse further waits. Used at shutdown.
    pub fn close(&self) {
        let mut state = self.lock();
        state.closed = true;
        state.latest = None;
        drop(state);
        self.changed.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    fn lock(&self) -> MutexGuard<'_, HubState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}
