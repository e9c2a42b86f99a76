use std::sync::Arc;

use tokio::sync::watch;

use crate::message::{ChatTurn, Settlement, Transcript, TurnId, TurnPatch};

/// Ordered transcript owner. Clones share the same underlying state.
///
/// The watch channel is the state itself: every mutation goes through `send_if_modified`,
/// which serializes writers and wakes subscribers only when something actually changed.
#[derive(Debug, Clone)]
pub struct MessageStore {
    state: Arc<watch::Sender<Transcript>>,
}

impl Default for MessageStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MessageStore {
    pub fn new() -> Self {
        let (state, _) = watch::channel(Transcript::default());
        Self {
            state: Arc::new(state),
        }
    }

    pub fn append(&self, turn: ChatTurn) {
        self.state.send_modify(|transcript| {
            transcript.turns.push(turn);
            transcript.revision += 1;
        });
    }

    /// Applies `patch` to the turn with `id`. Unknown ids and terminal turns are left alone.
    pub fn update_by_id(&self, id: TurnId, patch: TurnPatch) -> bool {
        self.state.send_if_modified(|transcript| {
            let Some(turn) = transcript.turns.iter_mut().find(|turn| turn.id == id) else {
                tracing::debug!(turn_id = %id, "ignoring update for unknown turn");
                return false;
            };

            if turn.status.is_terminal() {
                tracing::debug!(turn_id = %id, status = ?turn.status, "ignoring update for settled turn");
                return false;
            }

            let changed = turn.apply(patch);
            if changed {
                transcript.revision += 1;
            }
            changed
        })
    }

    pub fn snapshot(&self) -> Vec<ChatTurn> {
        self.state.borrow().turns.clone()
    }

    pub fn transcript(&self) -> Transcript {
        self.state.borrow().clone()
    }

    pub fn turn(&self, id: TurnId) -> Option<ChatTurn> {
        self.state.borrow().turn(id).cloned()
    }

    pub fn len(&self) -> usize {
        self.state.borrow().turns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn exchange_outstanding(&self) -> bool {
        self.state.borrow().exchange_outstanding
    }

    pub fn subscribe(&self) -> watch::Receiver<Transcript> {
        self.state.subscribe()
    }

    /// Phase one: atomically appends both placeholders unless an exchange is already open.
    pub fn begin_exchange(&self, user_turn: ChatTurn, assistant_turn: ChatTurn) -> bool {
        self.state.send_if_modified(|transcript| {
            if transcript.exchange_outstanding {
                return false;
            }

            transcript.turns.push(user_turn);
            transcript.turns.push(assistant_turn);
            transcript.exchange_outstanding = true;
            transcript.last_error = None;
            transcript.revision += 1;
            true
        })
    }

    /// Phase two: writes the terminal text and status, then closes the exchange.
    pub fn settle(&self, id: TurnId, settlement: Settlement) {
        let (patch, error) = settlement.into_patch();

        self.state.send_modify(|transcript| {
            match transcript.turns.iter_mut().find(|turn| turn.id == id) {
                Some(turn) if !turn.status.is_terminal() => {
                    turn.apply(patch);
                }
                Some(turn) => {
                    tracing::warn!(turn_id = %id, status = ?turn.status, "turn was already settled");
                }
                None => {
                    tracing::warn!(turn_id = %id, "settling an unknown turn");
                }
            }

            if error.is_some() {
                transcript.last_error = error;
            }
            transcript.exchange_outstanding = false;
            transcript.revision += 1;
        });
    }
}
