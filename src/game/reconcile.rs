//! Server-side validation of client paddle input

use super::physics::{Vec2, BOARD_HEIGHT, BOARD_WIDTH, PADDLE_RADIUS};
use super::Side;

/// Furthest a paddle may travel in one tick (anti-cheat)
pub const MAX_PADDLE_STEP: f32 = 80.0;

/// Paddle movement requested by a client
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PaddleIntent {
    Delta { dx: f32, dy: f32 },
    Position { x: f32, y: f32 },
}

impl PaddleIntent {
    /// Fold a newer intent received within the same tick into this one.
    /// Deltas add up; anything else is replaced by the newer value.
    pub fn coalesce(self, newer: PaddleIntent) -> PaddleIntent {
        match (self, newer) {
            (PaddleIntent::Delta { dx, dy }, PaddleIntent::Delta { dx: ndx, dy: ndy }) => {
                PaddleIntent::Delta {
                    dx: dx + ndx,
                    dy: dy + ndy,
                }
            }
            (_, newer) => newer,
        }
    }
}

/// Legal area for a seat's paddle centre
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PaddleRegion {
    pub min_x: f32,
    pub max_x: f32,
    pub min_y: f32,
    pub max_y: f32,
}

impl PaddleRegion {
    pub fn for_side(side: Side) -> Self {
        let half = BOARD_HEIGHT / 2.0;
        let (min_y, max_y) = match side {
            Side::Top => (PADDLE_RADIUS, half - PADDLE_RADIUS),
            Side::Bottom => (half + PADDLE_RADIUS, BOARD_HEIGHT - PADDLE_RADIUS),
        };
        Self {
            min_x: PADDLE_RADIUS,
            max_x: BOARD_WIDTH - PADDLE_RADIUS,
            min_y,
            max_y,
        }
    }

    pub fn clamp(&self, p: Vec2) -> Vec2 {
        Vec2::new(
            p.x.clamp(self.min_x, self.max_x),
            p.y.clamp(self.min_y, self.max_y),
        )
    }

    pub fn contains(&self, p: Vec2) -> bool {
        (self.min_x..=self.max_x).contains(&p.x) && (self.min_y..=self.max_y).contains(&p.y)
    }
}

/// Outcome of reconciling one intent
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Reconciled {
    Moved(Vec2),
    Unchanged,
    /// Non-finite values or an implausible jump
    Rejected,
}

/// Turn a client intent into an authoritative paddle position
pub fn reconcile(side: Side, current: Vec2, intent: PaddleIntent) -> Reconciled {
    let region = PaddleRegion::for_side(side);

    let target = match intent {
        PaddleIntent::Delta { dx, dy } => {
            if !dx.is_finite() || !dy.is_finite() {
                return Reconciled::Rejected;
            }
            let step = Vec2::new(dx, dy);
            let len = step.length();
            let step = if len > MAX_PADDLE_STEP {
                step.scale(MAX_PADDLE_STEP / len)
            } else {
                step
            };
            region.clamp(Vec2::new(current.x + step.x, current.y + step.y))
        }
        PaddleIntent::Position { x, y } => {
            if !x.is_finite() || !y.is_finite() {
                return Reconciled::Rejected;
            }
            let target = region.clamp(Vec2::new(x, y));
            // A paddle that was pushed out of its region (e.g. stale state)
            // may always be brought back in.
            if region.contains(current) && current.distance(target) > MAX_PADDLE_STEP {
                return Reconciled::Rejected;
            }
            target
        }
    };

    if target == current {
        Reconciled::Unchanged
    } else {
        Reconciled::Moved(target)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::game::physics::paddle_home;
    use proptest::prelude::*;

    #[test]
    fn absolute_position_inside_region_is_taken() {
        let out = reconcile(Side::Top, paddle_home(Side::Top), PaddleIntent::Position { x: 200.0, y: 50.0 });
        assert_eq!(out, Reconciled::Moved(Vec2::new(200.0, 50.0)));
    }

    #[test]
    fn absolute_position_is_clamped_to_own_half() {
        let current = Vec2::new(200.0, 300.0);
        let out = reconcile(Side::Top, current, PaddleIntent::Position { x: 200.0, y: 360.0 });
        assert_eq!(out, Reconciled::Moved(Vec2::new(200.0, 335.0)));
    }

    #[test]
    fn teleport_is_rejected() {
        let out = reconcile(
            Side::Bottom,
            paddle_home(Side::Bottom),
            PaddleIntent::Position { x: 20.0, y: 380.0 },
        );
        assert_eq!(out, Reconciled::Rejected);
    }

    #[test]
    fn repeated_position_is_idempotent() {
        let intent = PaddleIntent::Position { x: 210.0, y: 60.0 };
        let first = match reconcile(Side::Top, paddle_home(Side::Top), intent) {
            Reconciled::Moved(p) => p,
            other => panic!("expected a move, got {other:?}"),
        };
        assert_eq!(reconcile(Side::Top, first, intent), Reconciled::Unchanged);
    }

    #[test]
    fn huge_delta_is_clipped_then_clamped() {
        let home = paddle_home(Side::Bottom);
        let out = reconcile(Side::Bottom, home, PaddleIntent::Delta { dx: 10_000.0, dy: 0.0 });
        assert_eq!(out, Reconciled::Moved(Vec2::new(home.x + MAX_PADDLE_STEP, home.y)));
    }

    #[test]
    fn nan_input_is_rejected() {
        let home = paddle_home(Side::Top);
        assert_eq!(
            reconcile(Side::Top, home, PaddleIntent::Delta { dx: f32::NAN, dy: 1.0 }),
            Reconciled::Rejected
        );
        assert_eq!(
            reconcile(Side::Top, home, PaddleIntent::Position { x: f32::INFINITY, y: 1.0 }),
            Reconciled::Rejected
        );
    }

    #[test]
    fn deltas_accumulate_and_positions_replace() {
        let a = PaddleIntent::Delta { dx: 15.0, dy: 0.0 };
        let b = PaddleIntent::Delta { dx: 15.0, dy: -15.0 };
        assert_eq!(a.coalesce(b), PaddleIntent::Delta { dx: 30.0, dy: -15.0 });

        let p = PaddleIntent::Position { x: 1.0, y: 2.0 };
        assert_eq!(a.coalesce(p), p);
        assert_eq!(p.coalesce(a), a);
    }

    proptest! {
        #[test]
        fn paddle_never_leaves_its_region(
            top in any::<bool>(),
            dx in -10_000.0f32..10_000.0,
            dy in -10_000.0f32..10_000.0,
            absolute in any::<bool>(),
        ) {
            let side = if top { Side::Top } else { Side::Bottom };
            let region = PaddleRegion::for_side(side);
            let mut paddle = paddle_home(side);
            for _ in 0..5 {
                let intent = if absolute {
                    PaddleIntent::Position { x: dx, y: dy }
                } else {
                    PaddleIntent::Delta { dx, dy }
                };
                if let Reconciled::Moved(p) = reconcile(side, paddle, intent) {
                    prop_assert!(p.distance(paddle) <= MAX_PADDLE_STEP + 1e-3);
                    paddle = p;
                }
                prop_assert!(region.contains(paddle));
            }
        }
    }
}
