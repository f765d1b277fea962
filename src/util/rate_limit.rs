//! Rate limiting utilities

use governor::{
    clock::DefaultClock,
    state::{InMemoryState, NotKeyed},
    Quota, RateLimiter,
};
use std::num::NonZeroU32;
use std::sync::Arc;

/// Rate limiter type alias
pub type Limiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

/// Create a rate limiter with the specified requests per second
pub fn create_limiter(requests_per_second: u32) -> Arc<Limiter> {
    let quota = Quota::per_second(NonZeroU32::new(requests_per_second).unwrap_or(NonZeroU32::MIN));
    Arc::new(RateLimiter::direct(quota))
}

/// Max inbound frames per second per connection. Paddle updates above the
/// tick rate are coalesced by the room, this only stops floods.
pub const INPUT_RATE_LIMIT: u32 = 240;

/// Room creation attempts per second per connection
pub const ROOM_CREATE_RATE_LIMIT: u32 = 2;

/// Per-connection rate limiter state
#[derive(Clone)]
pub struct ConnectionRateLimiter {
    input_limiter: Arc<Limiter>,
    room_create_limiter: Arc<Limiter>,
}

impl ConnectionRateLimiter {
    pub fn new() -> Self {
        Self::with_limits(INPUT_RATE_LIMIT, ROOM_CREATE_RATE_LIMIT)
    }

    pub fn with_limits(input_per_sec: u32, room_create_per_sec: u32) -> Self {
        Self {
            input_limiter: create_limiter(input_per_sec),
            room_create_limiter: create_limiter(room_create_per_sec),
        }
    }

    /// Check if an inbound frame is allowed (returns true if allowed)
    pub fn check_input(&self) -> bool {
        self.input_limiter.check().is_ok()
    }

    /// Check if a room creation request is allowed
    pub fn check_room_create(&self) -> bool {
        self.room_create_limiter.check().is_ok()
    }
}

impl Default for ConnectionRateLimiter {
    fn default() -> Self {
        Self::new()
    }
}
