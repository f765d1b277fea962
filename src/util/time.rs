//! Time and tick-rate utilities for the match simulation

use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

/// Get current Unix timestamp in milliseconds
pub fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
        .as_millis() as u64
}

/// Server start time for uptime tracking
static SERVER_START: std::sync::OnceLock<Instant> = std::sync::OnceLock::new();

/// Initialize server start time (call once at startup)
pub fn init_server_time() {
    SERVER_START.get_or_init(Instant::now);
}

/// Get server uptime in seconds
pub fn uptime_secs() -> u64 {
    SERVER_START
        .get()
        .map(|start| start.elapsed().as_secs())
        .unwrap_or(0)
}

/// Simulation rate. Velocities are expressed in board units per tick.
pub const SIMULATION_TPS: u32 = 60;
pub const TICK_DURATION_MICROS: u64 = 1_000_000 / SIMULATION_TPS as u64;

/// Wall-clock length of one tick
pub fn tick_duration() -> Duration {
    Duration::from_micros(TICK_DURATION_MICROS)
}

/// Convert a duration in seconds to a whole number of ticks (rounded up)
pub fn secs_to_ticks(secs: f32) -> u64 {
    if secs <= 0.0 {
        return 0;
    }
    (secs * SIMULATION_TPS as f32).ceil() as u64
}

/// Convert a tick count back to whole seconds
pub fn ticks_to_secs(ticks: u64) -> u32 {
    (ticks / SIMULATION_TPS as u64) as u32
}
