//! Elasticity thresholds.

/// When the fleet grows and shrinks.
#[derive(Debug, Clone, Copy, clap::Parser)]
pub struct ScalingConfig {
    /// A scale-up fires when the fleet's remaining free space drops to this
    /// many bytes or fewer.
    #[clap(
        long = "scale-up-threshold",
        env = "SU_THRESHOLD",
        default_value = "30",
        action
    )]
    pub scale_up_threshold: u64,

    /// The top cell becomes a drain candidate when the fleet could lose it
    /// and still keep this many bytes of headroom.
    #[clap(
        long = "scale-down-threshold",
        env = "SD_THRESHOLD",
        default_value = "60",
        action
    )]
    pub scale_down_threshold: u64,
}
