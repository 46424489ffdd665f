//! Stream lifecycle state machine
//!
//! ```text
//! CREATING -> ACTIVE <-> SCALING
//!             ACTIVE  -> SEALING -> SEALED
//! ```

use riverbed_common::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle state of a stream
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StreamState {
    Creating,
    Active,
    Scaling,
    Sealing,
    Sealed,
}

impl StreamState {
    /// Whether `self -> next` is an edge of the state machine
    #[must_use]
    pub const fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Creating, Self::Active)
                | (Self::Active, Self::Scaling)
                | (Self::Scaling, Self::Active)
                | (Self::Active, Self::Sealing)
                | (Self::Sealing, Self::Sealed)
        )
    }

    /// Fail with `IllegalState` unless `self -> next` is allowed
    pub fn check_transition(self, next: Self) -> Result<()> {
        if self.can_transition_to(next) {
            Ok(())
        } else {
            Err(Error::illegal_state(format!(
                "stream cannot move from {self} to {next}"
            )))
        }
    }

    /// Sealing or sealed
    #[must_use]
    pub const fn is_terminating(self) -> bool {
        matches!(self, Self::Sealing | Self::Sealed)
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Creating => "CREATING",
            Self::Active => "ACTIVE",
            Self::Scaling => "SCALING",
            Self::Sealing => "SEALING",
            Self::Sealed => "SEALED",
        }
    }
}

impl fmt::Display for StreamState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
