use clap::Parser;

use crate::constants::{DEFAULT_POINT_CAPACITY, DEFAULT_QUEUE_CAPACITY, DEFAULT_TRACK_CAPACITY};

/// Track Server Configuration
#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
pub struct Config {
    /// Maximum number of concurrent tracks in the pool.
    #[arg(long, default_value_t = DEFAULT_TRACK_CAPACITY)]
    pub track_capacity: usize,

    /// Retained points per track window.
    #[arg(long, default_value_t = DEFAULT_POINT_CAPACITY)]
    pub point_capacity: usize,

    /// Command queue bound, counted in command records.
    #[arg(long, default_value_t = DEFAULT_QUEUE_CAPACITY)]
    pub queue_capacity: usize,

    /// Status logging interval in seconds, -1 to disable.
    #[arg(long, default_value_t = 15)]
    pub status_interval: i32,

    /// Directory for the tracks.json state dump. Empty = no file writes.
    #[arg(long, value_name = "DIR", default_value = "")]
    pub work_dir: String,

    /// Send packed track frames to host:port over UDP.
    #[arg(long, value_name = "HOST:PORT")]
    pub track_output: Option<String>,

    /// Listen on host:port for operator control datagrams (merge, clear-all).
    #[arg(long, value_name = "ADDR")]
    pub control_listen: Option<String>,

    /// Run the built-in target simulator.
    #[arg(long, default_value_t = false)]
    pub sim: bool,

    /// Number of simulated targets.
    #[arg(long, default_value_t = 20)]
    pub sim_targets: usize,

    /// Simulator update period in milliseconds.
    #[arg(long, default_value_t = 500)]
    pub sim_interval_ms: u64,

    /// Station latitude in degrees (simulator geometry).
    #[arg(long, default_value_t = 30.0)]
    pub latitude: f64,

    /// Station longitude in degrees (simulator geometry).
    #[arg(long, default_value_t = 120.0)]
    pub longitude: f64,

    /// Verbose logging (DEBUG level)
    #[arg(long, short, default_value_t = false)]
    pub verbose: bool,
}
