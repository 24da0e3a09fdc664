mod rt_stats;
mod tracker;

pub use rt_stats::{
    stat_scale_to_time, time_to_stat_scale, timeout_weights, ResponseTimeStats,
    ResponseTimeWeights, TIME_STAT_LENGTH,
};
pub use tracker::{NodeValueTracker, ValueTracker};
