//! Greedy piecewise-linear regression.
//!
//! Models the key-to-position mapping of one table file as an ordered list
//! of line segments. Training maintains an error cone anchored at the
//! intersection of the current upper and lower bounding lines; a point
//! falling outside the cone ends the segment and starts the next one. Every
//! emitted segment predicts each training position it covers within
//! ±gamma.

use itertools::Itertools as _;

use crate::errinput;
use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

/// A line `y = a*x + b`.
#[derive(Debug, Clone, Copy)]
struct Line {
    a: f64,
    b: f64,
}

/// One trained segment: for x in `[start, stop]`, position ≈ `k*x + b`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Segment {
    pub start: f64,
    pub k: f64,
    pub b: f64,
    pub stop: f64,
}

impl Segment {
    pub fn predict(&self, x: f64) -> f64 {
        self.k * x + self.b
    }
}

fn line_through(p1: Point, p2: Point) -> Line {
    let a = (p2.y - p1.y) / (p2.x - p1.x);
    Line { a, b: p1.y - a * p1.x }
}

fn intersection(l1: Line, l2: Line) -> Point {
    let x = (l2.b - l1.b) / (l1.a - l2.a);
    Point { x, y: l1.a * x + l1.b }
}

// Points exactly on a bounding line count as inside the cone.
fn is_above(pt: Point, line: Line) -> bool {
    pt.y > line.a * pt.x + line.b
}

fn is_below(pt: Point, line: Line) -> bool {
    pt.y < line.a * pt.x + line.b
}

fn upper_bound(pt: Point, gamma: f64) -> Point {
    Point { x: pt.x, y: pt.y + gamma }
}

fn lower_bound(pt: Point, gamma: f64) -> Point {
    Point { x: pt.x, y: pt.y - gamma }
}

enum State {
    /// No points yet.
    Need1,
    /// One anchor point; a run of points within ±gamma of it coalesces into
    /// a flat segment candidate.
    Need2 { s0: Point, last: Point },
    /// Active cone anchored at `sint`.
    Ready {
        s0: Point,
        last: Point,
        rho_lower: Line,
        rho_upper: Line,
        sint: Point,
    },
}

/// Greedy PLR trainer: consumes strictly-ascending points one at a time and
/// emits a finished segment whenever the cone is violated.
pub struct GreedyPlr {
    gamma: f64,
    state: State,
}

impl GreedyPlr {
    pub fn new(gamma: f64) -> Self {
        Self {
            gamma,
            state: State::Need1,
        }
    }

    fn last_x(&self) -> Option<f64> {
        match &self.state {
            State::Need1 => None,
            State::Need2 { last, .. } | State::Ready { last, .. } => Some(last.x),
        }
    }

    /// Feeds one training point, returning the segment it closed, if any.
    pub fn process(&mut self, pt: Point) -> Result<Option<Segment>> {
        if let Some(last_x) = self.last_x() {
            if pt.x <= last_x {
                return errinput!("training points must have strictly ascending x: {} after {last_x}", pt.x);
            }
        }

        let state = std::mem::replace(&mut self.state, State::Need1);
        let (next, emitted) = match state {
            State::Need1 => (State::Need2 { s0: pt, last: pt }, None),
            State::Need2 { s0, .. } => {
                if (pt.y - s0.y).abs() <= self.gamma {
                    // Still flat within tolerance; keep absorbing.
                    (State::Need2 { s0, last: pt }, None)
                } else {
                    (self.open_cone(s0, pt), None)
                }
            }
            State::Ready {
                s0,
                last,
                mut rho_lower,
                mut rho_upper,
                sint,
            } => {
                if is_above(pt, rho_upper) || is_below(pt, rho_lower) {
                    let segment = cone_segment(s0, last, rho_lower, rho_upper, sint);
                    (State::Need2 { s0: pt, last: pt }, Some(segment))
                } else {
                    // Tighten the cone only when the shifted point actually
                    // narrows it; every slope left inside stays within gamma
                    // of all processed points.
                    let s_upper = upper_bound(pt, self.gamma);
                    let s_lower = lower_bound(pt, self.gamma);
                    if is_below(s_upper, rho_upper) {
                        rho_upper = line_through(sint, s_upper);
                    }
                    if is_above(s_lower, rho_lower) {
                        rho_lower = line_through(sint, s_lower);
                    }
                    (
                        State::Ready {
                            s0,
                            last: pt,
                            rho_lower,
                            rho_upper,
                            sint,
                        },
                        None,
                    )
                }
            }
        };
        self.state = next;
        Ok(emitted)
    }

    fn open_cone(&self, s0: Point, s1: Point) -> State {
        let rho_lower = line_through(upper_bound(s0, self.gamma), lower_bound(s1, self.gamma));
        let rho_upper = line_through(lower_bound(s0, self.gamma), upper_bound(s1, self.gamma));
        let sint = intersection(rho_upper, rho_lower);
        State::Ready {
            s0,
            last: s1,
            rho_lower,
            rho_upper,
            sint,
        }
    }

    /// Flushes the in-progress segment. A lone flat run becomes a
    /// horizontal segment through its anchor.
    pub fn finish(self) -> Option<Segment> {
        match self.state {
            State::Need1 => None,
            State::Need2 { s0, last } => Some(Segment {
                start: s0.x,
                k: 0.0,
                b: s0.y,
                stop: last.x,
            }),
            State::Ready {
                s0,
                last,
                rho_lower,
                rho_upper,
                sint,
            } => Some(cone_segment(s0, last, rho_lower, rho_upper, sint)),
        }
    }
}

/// Emits the cone's bisector over `[s0.x, last.x]`.
fn cone_segment(s0: Point, last: Point, rho_lower: Line, rho_upper: Line, sint: Point) -> Segment {
    let k = (rho_lower.a + rho_upper.a) / 2.0;
    Segment {
        start: s0.x,
        k,
        b: sint.y - k * sint.x,
        stop: last.x,
    }
}

/// A trained model over one file: ordered segments plus the residual used
/// to widen predicted ranges.
#[derive(Debug, Clone)]
pub struct PlrModel {
    gamma: f64,
    residual: f64,
    segments: Vec<Segment>,
}

impl PlrModel {
    /// Trains on strictly-ascending `(x, position)` pairs.
    pub fn train(gamma: f64, points: &[Point]) -> Result<PlrModel> {
        if !(gamma > 0.0) {
            return errinput!("gamma must be positive, got {gamma}");
        }

        let mut trainer = GreedyPlr::new(gamma);
        let mut segments = Vec::new();
        for &pt in points {
            if let Some(segment) = trainer.process(pt)? {
                segments.push(segment);
            }
        }
        if let Some(segment) = trainer.finish() {
            segments.push(segment);
        }

        if !segments.iter().tuple_windows().all(|(a, b)| a.stop < b.start) {
            return Err(Error::ModelInvariant(
                "trained segments are not in ascending order".to_string(),
            ));
        }

        // The measured residual bounds every training prediction; the cone
        // construction keeps it within gamma.
        let mut model = PlrModel {
            gamma,
            residual: 0.0,
            segments,
        };
        for pt in points {
            if let Some(predicted) = model.predict(pt.x) {
                model.residual = model.residual.max((predicted - pt.y).abs());
            }
        }
        Ok(model)
    }

    /// Predicted position for `x`, from the segment covering it (the last
    /// segment starting at or before `x`; extrapolated at the edges).
    pub fn predict(&self, x: f64) -> Option<f64> {
        if self.segments.is_empty() {
            return None;
        }
        let idx = self.segments.partition_point(|segment| segment.start <= x);
        let segment = &self.segments[idx.saturating_sub(1)];
        Some(segment.predict(x))
    }

    /// Inclusive position range for `x` in a file of `entry_count` entries.
    /// The width is bounded by twice the residual plus a rounding margin.
    pub fn position_range(&self, x: f64, entry_count: u64) -> Option<(u64, u64)> {
        if entry_count == 0 {
            return None;
        }
        let predicted = self.predict(x)?;
        let margin = self.residual + 1.0;
        let max = (entry_count - 1) as f64;
        let lower = (predicted - margin).floor().clamp(0.0, max) as u64;
        let upper = (predicted + margin).ceil().clamp(0.0, max) as u64;
        Some((lower, upper))
    }

    pub fn gamma(&self) -> f64 {
        self.gamma
    }

    pub fn residual(&self) -> f64 {
        self.residual
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }
}
