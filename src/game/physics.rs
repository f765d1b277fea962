//! Board geometry, puck movement and collisions

use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::warn;

use super::{PerSide, Side};

pub const BOARD_WIDTH: f32 = 406.0;
pub const BOARD_HEIGHT: f32 = 700.0;
pub const PADDLE_RADIUS: f32 = 15.0;
pub const PUCK_RADIUS: f32 = 12.0;

/// Width of a goal opening at ratio 1.0
pub const GOAL_FULL_WIDTH: f32 = 240.0;
/// Opening ratio with no shrink skill in effect (120 units)
pub const DEFAULT_GOAL_RATIO: f32 = 0.5;

/// Puck speed after a serve, in units per tick
pub const SERVE_SPEED: f32 = 7.0;
/// Speed floor applied after collisions
pub const MIN_PUCK_SPEED: f32 = 3.0;
/// Speed ceiling applied after collisions
pub const MAX_PUCK_SPEED: f32 = 24.0;
/// Maximum serve deviation from vertical (radians)
pub const SERVE_SPREAD: f32 = std::f32::consts::FRAC_PI_4;

/// Distance of a paddle's starting spot from its own goal line
pub const PADDLE_START_OFFSET: f32 = 30.0;

/// 2D point or vector
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Vec2 {
    pub x: f32,
    pub y: f32,
}

impl Vec2 {
    pub const ZERO: Vec2 = Vec2 { x: 0.0, y: 0.0 };

    pub fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }

    pub fn length(self) -> f32 {
        (self.x * self.x + self.y * self.y).sqrt()
    }

    pub fn distance(self, other: Vec2) -> f32 {
        Vec2::new(self.x - other.x, self.y - other.y).length()
    }

    pub fn scale(self, k: f32) -> Vec2 {
        Vec2::new(self.x * k, self.y * k)
    }

    pub fn is_finite(self) -> bool {
        self.x.is_finite() && self.y.is_finite()
    }
}

/// Centre of the board
pub fn board_center() -> Vec2 {
    Vec2::new(BOARD_WIDTH / 2.0, BOARD_HEIGHT / 2.0)
}

/// Starting paddle position for a side
pub fn paddle_home(side: Side) -> Vec2 {
    match side {
        Side::Top => Vec2::new(BOARD_WIDTH / 2.0, PADDLE_START_OFFSET),
        Side::Bottom => Vec2::new(BOARD_WIDTH / 2.0, BOARD_HEIGHT - PADDLE_START_OFFSET),
    }
}

/// The puck
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Puck {
    pub pos: Vec2,
    pub vel: Vec2,
    pub radius: f32,
}

impl Puck {
    /// Puck at rest in the centre
    pub fn centered() -> Self {
        Self {
            pos: board_center(),
            vel: Vec2::ZERO,
            radius: PUCK_RADIUS,
        }
    }

    pub fn speed(&self) -> f32 {
        self.vel.length()
    }
}

/// Horizontal extent of a goal opening
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GoalOpening {
    pub min_x: f32,
    pub max_x: f32,
}

impl GoalOpening {
    pub fn for_ratio(ratio: f32) -> Self {
        let half = GOAL_FULL_WIDTH * ratio.clamp(0.0, 1.0) / 2.0;
        let center = BOARD_WIDTH / 2.0;
        Self {
            min_x: center - half,
            max_x: center + half,
        }
    }

    pub fn contains(&self, x: f32) -> bool {
        x >= self.min_x && x <= self.max_x
    }
}

/// Result of a paddle/puck overlap test
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Contact {
    /// Circles apart
    None,
    /// Circles overlap; `reflected` is false when the puck was already
    /// moving away and only got pushed out
    Touching { reflected: bool },
}

/// Physics system for the puck
pub struct PhysicsSystem;

impl PhysicsSystem {
    /// Advance the puck by one tick of velocity
    pub fn integrate(puck: &mut Puck) {
        puck.pos.x += puck.vel.x;
        puck.pos.y += puck.vel.y;
    }

    /// Reflect off side walls and off the end walls outside the goal
    /// openings. The puck centre never leaves the board.
    pub fn resolve_walls(puck: &mut Puck, goal_ratios: &PerSide<f32>) {
        let r = puck.radius;

        if puck.pos.x - r < 0.0 {
            puck.pos.x = r;
            puck.vel.x = puck.vel.x.abs();
        } else if puck.pos.x + r > BOARD_WIDTH {
            puck.pos.x = BOARD_WIDTH - r;
            puck.vel.x = -puck.vel.x.abs();
        }

        let top = GoalOpening::for_ratio(goal_ratios.top);
        if puck.pos.y - r < 0.0 {
            if top.contains(puck.pos.x) {
                puck.pos.y = puck.pos.y.max(0.0);
            } else {
                puck.pos.y = r;
                puck.vel.y = puck.vel.y.abs();
            }
        }

        let bottom = GoalOpening::for_ratio(goal_ratios.bottom);
        if puck.pos.y + r > BOARD_HEIGHT {
            if bottom.contains(puck.pos.x) {
                puck.pos.y = puck.pos.y.min(BOARD_HEIGHT);
            } else {
                puck.pos.y = BOARD_HEIGHT - r;
                puck.vel.y = -puck.vel.y.abs();
            }
        }
    }

    /// Side that scores, if the puck reached a goal line inside its opening.
    /// The top goal is checked first.
    pub fn check_goal(puck: &Puck, goal_ratios: &PerSide<f32>) -> Option<Side> {
        if puck.pos.y <= 0.0 && GoalOpening::for_ratio(goal_ratios.top).contains(puck.pos.x) {
            return Some(Side::Bottom);
        }
        if puck.pos.y >= BOARD_HEIGHT
            && GoalOpening::for_ratio(goal_ratios.bottom).contains(puck.pos.x)
        {
            return Some(Side::Top);
        }
        None
    }

    /// Circle/circle test between a paddle and the puck. On overlap the puck
    /// is moved to the contact distance and, if it was approaching, its
    /// velocity is reflected across the collision normal.
    pub fn resolve_paddle_contact(puck: &mut Puck, paddle: Vec2, facing: f32) -> Contact {
        let min_dist = PADDLE_RADIUS + puck.radius;
        let dx = puck.pos.x - paddle.x;
        let dy = puck.pos.y - paddle.y;
        let dist_sq = dx * dx + dy * dy;

        if dist_sq > min_dist * min_dist {
            return Contact::None;
        }

        let dist = dist_sq.sqrt();
        let (nx, ny) = if dist < 0.001 {
            warn!(
                paddle_x = paddle.x,
                paddle_y = paddle.y,
                "Puck centred on paddle, pushing along facing"
            );
            (0.0, facing)
        } else {
            (dx / dist, dy / dist)
        };

        puck.pos.x = paddle.x + nx * min_dist;
        puck.pos.y = paddle.y + ny * min_dist;

        let dot = puck.vel.x * nx + puck.vel.y * ny;
        if dot < 0.0 {
            puck.vel.x -= 2.0 * dot * nx;
            puck.vel.y -= 2.0 * dot * ny;
            Contact::Touching { reflected: true }
        } else {
            Contact::Touching { reflected: false }
        }
    }

    /// Scale a velocity into the allowed speed band, keeping its direction
    pub fn clamp_speed(vel: Vec2, min: f32, max: f32) -> Vec2 {
        let speed = vel.length();
        if speed < 0.001 {
            // No direction to keep; nudge straight down the board
            return Vec2::new(0.0, min);
        }
        if speed > max {
            vel.scale(max / speed)
        } else if speed < min {
            vel.scale(min / speed)
        } else {
            vel
        }
    }

    /// Serve velocity aimed at the given side's goal
    pub fn serve_velocity<R: Rng>(rng: &mut R, toward: Side) -> Vec2 {
        let angle = rng.gen_range(-SERVE_SPREAD..=SERVE_SPREAD);
        let vy = match toward {
            Side::Top => -SERVE_SPEED * angle.cos(),
            Side::Bottom => SERVE_SPEED * angle.cos(),
        };
        Vec2::new(SERVE_SPEED * angle.sin(), vy)
    }

    /// Check the puck centre lies on the board
    pub fn in_bounds(puck: &Puck) -> bool {
        puck.pos.is_finite()
            && (0.0..=BOARD_WIDTH).contains(&puck.pos.x)
            && (0.0..=BOARD_HEIGHT).contains(&puck.pos.y)
    }
}
