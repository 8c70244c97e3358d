use crate::{error::EngineError, types::ConnectionState};

/// Pure connection lifecycle state machine.
///
/// The supervisor drives it; every mutation site lives there, so this
/// table is the single place the legal lifecycle is encoded.
#[derive(Debug, Clone)]
pub struct ConnectionStateMachine {
    state: ConnectionState,
}

impl Default for ConnectionStateMachine {
    fn default() -> Self {
        Self {
            state: ConnectionState::Closed,
        }
    }
}

impl ConnectionStateMachine {
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// A subscribe call is about to be issued.
    ///
    /// Valid from every state except `Exhausted`, which requires external
    /// re-initialization.
    pub fn begin_subscribe(&mut self) -> Result<ConnectionState, EngineError> {
        if self.state == ConnectionState::Exhausted {
            return Err(EngineError::invalid_state(self.state, "begin_subscribe"));
        }
        self.state = ConnectionState::Subscribing;
        Ok(self.state)
    }

    /// The transport reported a live subscription.
    pub fn mark_subscribed(&mut self) -> Result<ConnectionState, EngineError> {
        match self.state {
            ConnectionState::Subscribing | ConnectionState::Subscribed => {
                self.state = ConnectionState::Subscribed;
                Ok(self.state)
            }
            _ => Err(EngineError::invalid_state(self.state, "mark_subscribed")),
        }
    }

    /// A backoff timer was armed after a disconnect.
    pub fn mark_reconnect_scheduled(&mut self) -> Result<ConnectionState, EngineError> {
        match self.state {
            ConnectionState::Subscribing
            | ConnectionState::Subscribed
            | ConnectionState::ReconnectScheduled => {
                self.state = ConnectionState::ReconnectScheduled;
                Ok(self.state)
            }
            _ => Err(EngineError::invalid_state(
                self.state,
                "mark_reconnect_scheduled",
            )),
        }
    }

    /// The retry cap was reached. Terminal until re-initialization.
    pub fn mark_exhausted(&mut self) -> ConnectionState {
        self.state = ConnectionState::Exhausted;
        self.state
    }

    /// Teardown finished. Idempotent, valid from any state.
    pub fn close(&mut self) -> ConnectionState {
        self.state = ConnectionState::Closed;
        self.state
    }
}
