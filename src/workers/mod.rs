pub mod reachability_probe;
pub mod retry_sweep;
pub mod token_file_watch;

pub use reachability_probe::ReachabilityProbeWorker;
pub use retry_sweep::RetrySweepWorker;
pub use token_file_watch::TokenFileWatchWorker;
