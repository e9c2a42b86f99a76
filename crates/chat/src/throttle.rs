use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::task::JoinHandle;

use crate::frame::FrameClock;
use crate::message::{TurnId, TurnPatch};
use crate::store::MessageStore;

#[derive(Default)]
struct ThrottleState {
    /// Latest cumulative text not yet written to the store.
    pending: Option<String>,
    scheduled: Option<JoinHandle<()>>,
    cancelled: bool,
    flushes: u64,
}

/// Collapses cumulative-text notifications for one turn into at most one store update per frame.
pub struct StreamThrottler {
    shared: Arc<Mutex<ThrottleState>>,
    store: MessageStore,
    turn_id: TurnId,
    clock: Arc<dyn FrameClock>,
}

impl StreamThrottler {
    pub fn new(store: MessageStore, turn_id: TurnId, clock: Arc<dyn FrameClock>) -> Self {
        Self {
            shared: Arc::new(Mutex::new(ThrottleState::default())),
            store,
            turn_id,
            clock,
        }
    }

    pub fn turn_id(&self) -> TurnId {
        self.turn_id
    }

    /// Records `cumulative_text` and schedules one flush on the next frame if none is pending.
    ///
    /// Must be called from within a tokio runtime.
    pub fn notify(&self, cumulative_text: impl Into<String>) {
        let mut state = lock(&self.shared);
        if state.cancelled {
            return;
        }

        state.pending = Some(cumulative_text.into());
        if state.scheduled.is_some() {
            return;
        }

        let frame = self.clock.next_frame();
        let shared = Arc::clone(&self.shared);
        let store = self.store.clone();
        let turn_id = self.turn_id;

        state.scheduled = Some(tokio::spawn(async move {
            frame.await;
            flush(&shared, &store, turn_id);
        }));
    }

    /// Stops all further store writes from this throttler, including an already scheduled flush.
    pub fn cancel(&self) {
        let mut state = lock(&self.shared);
        if state.cancelled {
            return;
        }

        state.cancelled = true;
        state.pending = None;
        if let Some(task) = state.scheduled.take() {
            task.abort();
        }

        tracing::debug!(
            turn_id = %self.turn_id,
            flushes = state.flushes,
            "stream throttler cancelled"
        );
    }

    pub fn is_cancelled(&self) -> bool {
        lock(&self.shared).cancelled
    }

    /// Number of flushes that actually wrote text.
    pub fn flush_count(&self) -> u64 {
        lock(&self.shared).flushes
    }
}

impl Drop for StreamThrottler {
    fn drop(&mut self) {
        self.cancel();
    }
}

// The cancelled check and the store write share one critical section, so a flush can never
// land after `cancel` has returned.
fn flush(shared: &Mutex<ThrottleState>, store: &MessageStore, turn_id: TurnId) {
    let mut state = lock(shared);
    state.scheduled = None;
    if state.cancelled {
        return;
    }

    let Some(text) = state.pending.take() else {
        return;
    };

    if store.update_by_id(turn_id, TurnPatch::text(text)) {
        state.flushes += 1;
    }
}

fn lock(shared: &Mutex<ThrottleState>) -> MutexGuard<'_, ThrottleState> {
    shared.lock().unwrap_or_else(PoisonError::into_inner)
}
