/// Default cap on cached workers (published APIs with a live executor)
pub const DEFAULT_MAX_ACTIVE_WORKERS: usize = 50;
/// Default idle TTL before a worker is reaped (hours)
pub const DEFAULT_INACTIVE_TTL_HOURS: u64 = 2;
/// Default reaper tick (minutes)
pub const DEFAULT_CLEANUP_INTERVAL_MINUTES: u64 = 30;
/// Default stats logging tick (minutes)
pub const DEFAULT_STATS_INTERVAL_MINUTES: u64 = 60;
/// Default listen address for the dispatch server
pub const DEFAULT_BIND_ADDR: &str = "0.0.0.0:8001";
