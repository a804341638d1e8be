//! Formation planner: target positions for named geometric patterns.

use std::{f64::consts::TAU, fmt, str::FromStr};

use crate::error::FormationError;
use crate::session::Vector3;

/// Altitude every formation is flown at unless the operator overrides it.
pub const FORMATION_ALTITUDE: f64 = 5.0;

/// sin(60°), rounded the way operators quote it.
const TRIANGLE_HEIGHT: f64 = 0.866;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pattern {
    Line,
    Circle,
    Triangle,
}

impl Pattern {
    pub fn name(self) -> &'static str {
        match self {
            Pattern::Line => "line",
            Pattern::Circle => "circle",
            Pattern::Triangle => "triangle",
        }
    }
}

impl fmt::Display for Pattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Pattern {
    type Err = FormationError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "line" => Ok(Pattern::Line),
            "circle" => Ok(Pattern::Circle),
            "triangle" => Ok(Pattern::Triangle),
            _ => Err(FormationError::Unsupported(raw.to_string())),
        }
    }
}

/// Plan `pattern` for `count` agents at the default altitude.
pub fn plan(pattern: &str, size: f64, count: usize) -> Result<Vec<Vector3>, FormationError> {
    plan_at(pattern.parse()?, size, count, FORMATION_ALTITUDE)
}

/// Position `i` of the result belongs to the `i`-th agent in id order. A
/// triangle only places the first three agents.
pub fn plan_at(
    pattern: Pattern,
    size: f64,
    count: usize,
    altitude: f64,
) -> Result<Vec<Vector3>, FormationError> {
    let positions = match pattern {
        Pattern::Line => (0..count).map(|i| [i as f64 * size, 0.0, altitude]).collect(),
        Pattern::Circle => (0..count)
            .map(|i| {
                let angle = TAU * i as f64 / count as f64;
                [size * angle.cos(), size * angle.sin(), altitude]
            })
            .collect(),
        Pattern::Triangle => {
            if count < 3 {
                return Err(FormationError::TooFewAgents {
                    pattern: "triangle",
                    need: 3,
                    have: count,
                });
            }
            vec![
                [0.0, 0.0, altitude],
                [size, 0.0, altitude],
                [size / 2.0, size * TRIANGLE_HEIGHT, altitude],
            ]
        }
    };
    Ok(positions)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_close(actual: &[Vector3], expected: &[Vector3]) {
        assert_eq!(actual.len(), expected.len());
        for (a, e) in actual.iter().zip(expected) {
            for k in 0..3 {
                assert!((a[k] - e[k]).abs() < 1e-9, "{a:?} != {e:?}");
            }
        }
    }

    #[test]
    fn line_spaces_agents_along_x() {
        let alt = FORMATION_ALTITUDE;
        assert_close(
            &plan("line", 2.0, 3).unwrap(),
            &[[0.0, 0.0, alt], [2.0, 0.0, alt], [4.0, 0.0, alt]],
        );
    }

    #[test]
    fn circle_places_agents_at_equal_angles() {
        let alt = FORMATION_ALTITUDE;
        assert_close(
            &plan("circle", 1.0, 4).unwrap(),
            &[[1.0, 0.0, alt], [0.0, 1.0, alt], [-1.0, 0.0, alt], [0.0, -1.0, alt]],
        );
    }

    #[test]
    fn triangle_places_first_three() {
        let positions = plan_at(Pattern::Triangle, 2.0, 5, 1.5).unwrap();
        assert_close(
            &positions,
            &[[0.0, 0.0, 1.5], [2.0, 0.0, 1.5], [1.0, 1.732, 1.5]],
        );
    }

    #[test]
    fn triangle_needs_three_agents() {
        assert_eq!(
            plan("triangle", 1.0, 2).unwrap_err(),
            FormationError::TooFewAgents {
                pattern: "triangle",
                need: 3,
                have: 2
            }
        );
    }

    #[test]
    fn unknown_pattern_is_reported() {
        assert_eq!(
            plan("hexagon", 1.0, 6).unwrap_err(),
            FormationError::Unsupported("hexagon".into())
        );
        assert_eq!("Circle".parse::<Pattern>().unwrap(), Pattern::Circle);
    }

    #[test]
    fn empty_fleet_plans_nothing() {
        assert!(plan("line", 1.0, 0).unwrap().is_empty());
        assert!(plan("circle", 1.0, 0).unwrap().is_empty());
    }
}
