//! The process-wide scale state, published through a single atomic word.

use std::sync::atomic::{AtomicU64, Ordering};

use data_types::CellId;

/// The controller's scale state.
///
/// `Draining` and `ScalingDown` carry the ordinal of the top cell the
/// transition operates on, so readers need no second load to learn it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    /// Idle; no scale transition in flight.
    Snafu,
    /// A new top cell is being created.
    ScalingUp,
    /// The top cell's keys are being migrated off it.
    Draining {
        /// The cell being drained.
        top: CellId,
    },
    /// The (now empty) top cell is being destroyed.
    ScalingDown {
        /// The cell being destroyed.
        top: CellId,
    },
}

const TAG_SNAFU: u64 = 0;
const TAG_SCALING_UP: u64 = 1;
const TAG_DRAINING: u64 = 2;
const TAG_SCALING_DOWN: u64 = 3;

impl ServerState {
    // State tag in the low bits, top-cell ordinal in the high 32.
    fn encode(self) -> u64 {
        match self {
            Self::Snafu => TAG_SNAFU,
            Self::ScalingUp => TAG_SCALING_UP,
            Self::Draining { top } => TAG_DRAINING | ((top.get() as u64) << 32),
            Self::ScalingDown { top } => TAG_SCALING_DOWN | ((top.get() as u64) << 32),
        }
    }

    fn decode(v: u64) -> Self {
        let top = CellId::new((v >> 32) as u32);
        match v & 0xffff_ffff {
            TAG_SNAFU => Self::Snafu,
            TAG_SCALING_UP => Self::ScalingUp,
            TAG_DRAINING => Self::Draining { top },
            TAG_SCALING_DOWN => Self::ScalingDown { top },
            tag => unreachable!("corrupt state encoding: {tag}"),
        }
    }
}

/// Lock-free publication of the [`ServerState`].
///
/// Writes release, reads acquire: a reader observing a state also observes
/// every catalog update published before it. Transitions are admitted by
/// compare-and-swap so a stale writer loses instead of clobbering.
#[derive(Debug)]
pub struct StateCell(AtomicU64);

impl StateCell {
    /// A fresh cell in [`ServerState::Snafu`]: a restarted controller treats
    /// whatever the catalog holds as normal placements.
    pub fn new() -> Self {
        Self(AtomicU64::new(ServerState::Snafu.encode()))
    }

    /// The currently published state. May be stale by one update quantum.
    pub fn load(&self) -> ServerState {
        ServerState::decode(self.0.load(Ordering::Acquire))
    }

    /// Atomically move `from` -> `to`.
    ///
    /// On refusal the actually observed state is returned and nothing
    /// changes.
    pub fn transition(&self, from: ServerState, to: ServerState) -> Result<(), ServerState> {
        self.0
            .compare_exchange(from.encode(), to.encode(), Ordering::AcqRel, Ordering::Acquire)
            .map(drop)
            .map_err(ServerState::decode)
    }

    /// Unconditionally publish `state`. Reserved for failure paths that must
    /// not leave the machine stuck.
    pub(crate) fn force(&self, state: ServerState) {
        self.0.store(state.encode(), Ordering::Release);
    }
}

impl Default for StateCell {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_round_trip() {
        for state in [
            ServerState::Snafu,
            ServerState::ScalingUp,
            ServerState::Draining {
                top: CellId::new(7),
            },
            ServerState::ScalingDown {
                top: CellId::new(u32::MAX),
            },
        ] {
            assert_eq!(ServerState::decode(state.encode()), state);
        }
    }

    #[test]
    fn test_cas_admission() {
        let cell = StateCell::new();
        assert_eq!(cell.load(), ServerState::Snafu);

        cell.transition(ServerState::Snafu, ServerState::ScalingUp)
            .unwrap();

        // a second admission attempt observes the in-flight transition
        let refused = cell
            .transition(ServerState::Snafu, ServerState::ScalingUp)
            .unwrap_err();
        assert_eq!(refused, ServerState::ScalingUp);

        cell.transition(ServerState::ScalingUp, ServerState::Snafu)
            .unwrap();
        assert_eq!(cell.load(), ServerState::Snafu);
    }

    #[test]
    fn test_draining_carries_top_cell() {
        let cell = StateCell::new();
        cell.transition(
            ServerState::Snafu,
            ServerState::Draining {
                top: CellId::new(3),
            },
        )
        .unwrap();

        assert_eq!(
            cell.load(),
            ServerState::Draining {
                top: CellId::new(3)
            }
        );
    }
}
