use strum::{Display, EnumIter, IntoEnumIterator};
use tokio::sync::watch;
use tracing::debug;

#[derive(Clone, Copy, Debug, Default, Display, PartialEq, Eq, EnumIter)]
#[strum(serialize_all = "PascalCase")]
pub enum ConnectionState {
    #[default]
    New,
    Starting,
    Running,
    Stopping,
    Terminated,
    Failed,
}

impl ConnectionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ConnectionState::Terminated | ConnectionState::Failed)
    }

    pub fn transitions(&self) -> Vec<ConnectionState> {
        match self {
            ConnectionState::New => vec![ConnectionState::Starting],
            ConnectionState::Starting => vec![ConnectionState::Running, ConnectionState::Failed],
            ConnectionState::Running => vec![ConnectionState::Stopping, ConnectionState::Failed],
            ConnectionState::Stopping => vec![ConnectionState::Terminated],
            // Terminal states have no valid next states
            ConnectionState::Terminated | ConnectionState::Failed => vec![],
        }
    }

    pub fn invalid_transitions(&self) -> Vec<ConnectionState> {
        let valid = self.transitions();
        ConnectionState::iter()
            .filter(|s| *s != *self && !valid.contains(s))
            .collect()
    }
}

/// Observable connection state that only moves along valid transitions.
pub(crate) struct StateCell {
    peer: String,
    tx: watch::Sender<ConnectionState>,
}

impl StateCell {
    pub fn new(peer: String) -> Self {
        let (tx, _) = watch::channel(ConnectionState::New);
        Self { peer, tx }
    }

    pub fn get(&self) -> ConnectionState {
        *self.tx.borrow()
    }

    /// Moves to `next` if that is a valid transition. Exactly one caller
    /// wins any given transition.
    pub fn transition(&self, next: ConnectionState) -> bool {
        let mut from = None;
        let changed = self.tx.send_if_modified(|state| {
            if state.transitions().contains(&next) {
                from = Some(*state);
                *state = next;
                true
            } else {
                false
            }
        });
        if let Some(from) = from {
            debug!(peer = %self.peer, %from, to = %next, "Connection state changed");
        }
        changed
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.tx.subscribe()
    }
}
