//! Room lifecycle

pub mod registry;

pub use registry::{RoomError, RoomRegistry};
