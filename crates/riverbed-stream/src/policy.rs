//! Stream configuration and scaling policies

use riverbed_common::{Error, Result, ScopedStream};
use serde::{Deserialize, Serialize};

/// How a stream's parallelism may change
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum ScalingPolicy {
    /// Fixed number of segments; only manual scale changes it
    Fixed(u32),
    /// Scale on events per second per segment
    ByEventRate {
        target_rate: u32,
        scale_factor: u32,
        min_segments: u32,
    },
    /// Scale on kilobytes per second per segment
    ByDataRate {
        target_kbps: u32,
        scale_factor: u32,
        min_segments: u32,
    },
}

impl ScalingPolicy {
    /// Segment count of epoch 0 and the floor for automatic merges
    #[must_use]
    pub const fn min_segments(&self) -> u32 {
        match self {
            Self::Fixed(n) => *n,
            Self::ByEventRate { min_segments, .. } | Self::ByDataRate { min_segments, .. } => {
                *min_segments
            }
        }
    }

    /// Whether policy-driven scaling is allowed
    #[must_use]
    pub const fn allows_auto_scale(&self) -> bool {
        !matches!(self, Self::Fixed(_))
    }

    pub fn validate(&self) -> Result<()> {
        if self.min_segments() == 0 {
            return Err(Error::invalid_argument(
                "scaling policy needs at least one segment",
            ));
        }
        match self {
            Self::Fixed(_) => Ok(()),
            Self::ByEventRate {
                target_rate: target,
                scale_factor,
                ..
            }
            | Self::ByDataRate {
                target_kbps: target,
                scale_factor,
                ..
            } => {
                if *target == 0 || *scale_factor < 2 {
                    Err(Error::invalid_argument(
                        "rate-based policy needs a positive target and a scale factor of at least 2",
                    ))
                } else {
                    Ok(())
                }
            }
        }
    }
}

/// Configuration a stream is created with
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StreamConfiguration {
    pub stream: ScopedStream,
    pub scaling_policy: ScalingPolicy,
}

impl StreamConfiguration {
    #[must_use]
    pub const fn new(stream: ScopedStream, scaling_policy: ScalingPolicy) -> Self {
        Self {
            stream,
            scaling_policy,
        }
    }

    pub fn validate(&self) -> Result<()> {
        self.scaling_policy.validate()
    }
}
