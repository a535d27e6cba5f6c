//! Transport lifecycle state and its lock-free transition cell
//!
//! Legal path: `NotInitialized -> Opening -> Open -> Subscribing -> Receiving`.
//! Any state may move to `Closed` or `Error`; both are terminal.

use std::sync::atomic::{AtomicU8, Ordering};

/// Lifecycle state of one MQTT transport instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum TransportState {
    NotInitialized = 0,
    Opening = 1,
    Open = 2,
    Subscribing = 3,
    Receiving = 4,
    Closed = 5,
    Error = 6,
}

impl TransportState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::NotInitialized,
            1 => Self::Opening,
            2 => Self::Open,
            3 => Self::Subscribing,
            4 => Self::Receiving,
            5 => Self::Closed,
            _ => Self::Error,
        }
    }

    /// `Subscribing` and `Receiving` are sub-states of `Open`
    pub fn is_open_compatible(self) -> bool {
        matches!(self, Self::Open | Self::Subscribing | Self::Receiving)
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Closed | Self::Error)
    }
}

/// Atomic holder for [`TransportState`]; every mutation is a compare-and-swap
#[derive(Debug)]
pub struct AtomicTransportState {
    value: AtomicU8,
}

impl Default for AtomicTransportState {
    fn default() -> Self {
        Self::new(TransportState::NotInitialized)
    }
}

impl AtomicTransportState {
    pub fn new(initial: TransportState) -> Self {
        Self {
            value: AtomicU8::new(initial as u8),
        }
    }

    pub fn load(&self) -> TransportState {
        TransportState::from_u8(self.value.load(Ordering::Acquire))
    }

    /// Move `from -> to` only if the current state is exactly `from`.
    /// Exactly one of several concurrent callers wins.
    pub fn try_transition(&self, from: TransportState, to: TransportState) -> bool {
        self.value
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Force a move to `destination` unless the current state is one of `illegal`.
    ///
    /// Returns the state observed immediately before the attempt. When that state
    /// is in `illegal` nothing changed; otherwise the caller performed the move and
    /// must run the exit actions of the returned state.
    pub fn move_to_if_possible(
        &self,
        destination: TransportState,
        illegal: &[TransportState],
    ) -> TransportState {
        let mut previous = self.load();
        loop {
            if illegal.contains(&previous) {
                return previous;
            }
            match self.value.compare_exchange(
                previous as u8,
                destination as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return previous,
                Err(actual) => previous = TransportState::from_u8(actual),
            }
        }
    }
}
