//! Nearest-neighbour plane interpolation (§4.5.2).

use crate::controller::types::TrainingPoint;

const EPSILON: f64 = 1e-6;

struct Vec3 {
    x: f64,
    y: f64,
    z: f64,
}

impl Vec3 {
    fn sub(&self, other: &Vec3) -> Vec3 {
        Vec3 {
            x: self.x - other.x,
            y: self.y - other.y,
            z: self.z - other.z,
        }
    }

    fn cross(&self, other: &Vec3) -> Vec3 {
        Vec3 {
            x: self.y * other.z - self.z * other.y,
            y: self.z * other.x - self.x * other.z,
            z: self.x * other.y - self.y * other.x,
        }
    }

    fn magnitude(&self) -> f64 {
        (self.x * self.x + self.y * self.y + self.z * self.z).sqrt()
    }

    fn normalized(&self) -> Option<Vec3> {
        let mag = self.magnitude();
        if mag <= EPSILON {
            None
        } else {
            Some(Vec3 {
                x: self.x / mag,
                y: self.y / mag,
                z: self.z / mag,
            })
        }
    }
}

impl From<&TrainingPoint> for Vec3 {
    fn from(p: &TrainingPoint) -> Self {
        Vec3 {
            x: p.lux as f64,
            y: p.luma as f64,
            z: p.backlight as f64,
        }
    }
}

fn distance(query_lux: i64, query_luma: u8, lux_max_seen: i64, q: &TrainingPoint) -> f64 {
    let lux_term = (query_lux - q.lux) as f64 * 100.0 / lux_max_seen as f64;
    let luma_term = query_luma as f64 - q.luma as f64;
    (lux_term * lux_term + luma_term * luma_term).sqrt()
}

/// Predicts a backlight target for `(lux_cap, luma)` given the current training set and
/// `lux_max_seen`. `points` must be non-empty; `lux_max_seen` must be `>= 1`. `lux_cap`
/// should already be `min(L, lux_max_seen)` per §4.5.2.
pub fn predict(points: &[TrainingPoint], lux_cap: i64, luma: u8, lux_max_seen: i64) -> u8 {
    debug_assert!(!points.is_empty());

    let mut scored: Vec<&TrainingPoint> = points.iter().collect();
    scored.sort_by(|a, b| {
        distance(lux_cap, luma, lux_max_seen, a)
            .partial_cmp(&distance(lux_cap, luma, lux_max_seen, b))
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    let n1 = scored[0];
    if scored.len() < 3 {
        return n1.backlight.max(1);
    }
    let n2 = scored[1];
    let n3 = scored[2];

    let (p1, p2, p3) = (Vec3::from(n1), Vec3::from(n2), Vec3::from(n3));
    let v1 = p2.sub(&p1);
    let v2 = p3.sub(&p1);
    let normal = match v1.cross(&v2).normalized() {
        Some(n) => n,
        None => return n1.backlight.max(1), // colinear nearest three: degenerate plane
    };

    if normal.z.abs() <= EPSILON {
        return n1.backlight.max(1); // plane contains the vertical backlight axis
    }

    let t = p1.z
        - (normal.x * (lux_cap as f64 - p1.x) + normal.y * (luma as f64 - p1.y)) / normal.z;

    t.round().clamp(1.0, 100.0) as u8
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pts(tuples: &[(i64, u8, u8)]) -> Vec<TrainingPoint> {
        tuples
            .iter()
            .map(|&(lux, luma, backlight)| TrainingPoint::new(lux, luma, backlight))
            .collect()
    }

    #[test]
    fn single_point_returns_its_backlight() {
        let points = pts(&[(100, 50, 42)]);
        assert_eq!(predict(&points, 100, 50, 100), 42);
    }

    #[test]
    fn two_points_fall_back_to_nearest() {
        let points = pts(&[(0, 0, 10), (1000, 0, 90)]);
        assert_eq!(predict(&points, 0, 0, 1000), 10);
    }

    #[test]
    fn plane_interpolation_matches_worked_example() {
        // §8 scenario 4: set {(0,0,10), (0,100,50), (100,0,20)}, query (50,50) -> 35.
        let points = pts(&[(0, 0, 10), (0, 100, 50), (100, 0, 20)]);
        assert_eq!(predict(&points, 50, 50, 100), 35);
    }

    #[test]
    fn colinear_neighbours_fall_back_to_nearest() {
        // Three points on a straight line in (lux, luma, backlight) space.
        let points = pts(&[(0, 0, 0), (50, 0, 50), (100, 0, 100)]);
        let target = predict(&points, 10, 0, 100);
        assert_eq!(target, 1); // nearest is (0,0,0), clamped into [1, 100]
    }

    #[test]
    fn prediction_is_always_in_valid_range() {
        let points = pts(&[(0, 0, 0), (0, 100, 100), (1000, 50, 50)]);
        for lux in [0, 10, 500, 1000, 5000] {
            for luma in [0u8, 25, 50, 75, 100] {
                let target = predict(&points, lux.min(1000), luma, 1000);
                assert!((1..=100).contains(&target));
            }
        }
    }
}
