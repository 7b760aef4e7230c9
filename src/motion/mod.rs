// src/motion/mod.rs - step-synchronized linear interpolation and arc subdivision

use std::f64::consts::PI;

use crate::config::Settings;
use crate::hardware::{Axis, AxisDriver, Clock, Direction, LimitFault};

/// Feed for a single move.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Feed {
    /// Commanded rate in millimeters per minute.
    Rate(f64),
    /// Total seconds for the whole move (inverse feed, G93).
    Duration(f64),
}

/// Arc plane: the two interpolated axes and the out-of-plane axis that is
/// held at its start value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Plane {
    pub axis_0: Axis,
    pub axis_1: Axis,
    pub linear: Axis,
}

impl Plane {
    pub const XY: Plane = Plane { axis_0: Axis::X, axis_1: Axis::Y, linear: Axis::Z };
    pub const XZ: Plane = Plane { axis_0: Axis::X, axis_1: Axis::Z, linear: Axis::Y };
    pub const YZ: Plane = Plane { axis_0: Axis::Y, axis_1: Axis::Z, linear: Axis::X };
}

/// Per-axis bookkeeping for one linear move. Rebuilt on every call, never
/// persisted.
struct AxisTravel {
    abs_steps: i64,
    dir: Direction,
    counter: i64,
}

/// Drives up to three axes simultaneously at a commanded rate.
///
/// Motion calls block the caller for the physical duration of the move; the
/// only suspension points are the per-iteration pacing sleeps. This is a
/// deliberate contract: a new line is never interpreted while a move is in
/// flight.
pub struct MotionEngine<D, C> {
    driver: D,
    clock: C,
}

impl<D: AxisDriver, C: Clock> MotionEngine<D, C> {
    pub fn new(driver: D, clock: C) -> Self {
        Self { driver, clock }
    }

    pub fn driver(&self) -> &D {
        &self.driver
    }

    pub fn driver_mut(&mut self) -> &mut D {
        &mut self.driver
    }

    pub fn clock(&self) -> &C {
        &self.clock
    }

    /// One checked step: honors the limit switch for (axis, direction) when
    /// limit checking is enabled.
    fn one_step(&mut self, settings: &Settings, axis: Axis, dir: Direction) -> Result<(), LimitFault> {
        if settings.limit_switch {
            if let Some(fault) = self.driver.limit(axis, dir) {
                return Err(fault);
            }
        }
        self.driver.step(axis, dir);
        Ok(())
    }

    /// Move all three axes from `position` to `target` in a straight line.
    ///
    /// `position` is advanced in place for every step actually issued, so on
    /// a limit fault it reflects the true physical location, steps already
    /// taken included. On success each axis has received exactly its rounded
    /// step count.
    pub fn line(
        &mut self,
        settings: &Settings,
        position: &mut [f64; 3],
        target: [f64; 3],
        feed: Feed,
    ) -> Result<(), LimitFault> {
        let mut travel: [AxisTravel; 3] = std::array::from_fn(|i| {
            let steps = ((target[i] - position[i]) * settings.steps_per_mm[i]).round() as i64;
            AxisTravel {
                abs_steps: steps.abs(),
                dir: if steps >= 0 { Direction::Positive } else { Direction::Negative },
                counter: 0,
            }
        });
        let maxsteps = travel.iter().map(|t| t.abs_steps).max().unwrap_or(0);
        if maxsteps == 0 {
            // Feed-rate-only lines and re-sent absolute targets land here.
            return Ok(());
        }

        for _ in 0..maxsteps {
            let iteration_start = self.clock.now_ms();
            let mut stepped = [false; 3];

            // Bresenham in step space: each axis accumulates its own step
            // count and fires once per overflow of the dominant count, so all
            // axes land on their exact totals after `maxsteps` iterations.
            for axis in Axis::ALL {
                let i = axis.index();
                travel[i].counter += travel[i].abs_steps;
                if travel[i].counter >= maxsteps {
                    travel[i].counter -= maxsteps;
                    let dir = travel[i].dir;
                    self.one_step(settings, axis, dir)?;
                    position[i] += dir.sign() as f64 / settings.steps_per_mm[i];
                    stepped[i] = true;
                }
            }

            // Pace the iteration so the whole move runs at the commanded
            // rate. Iterations that ran long are not compensated later.
            let mut dist_sq = 0.0;
            for i in 0..3 {
                if stepped[i] {
                    let mm = 1.0 / settings.steps_per_mm[i];
                    dist_sq += mm * mm;
                }
            }
            let budget_ms = match feed {
                Feed::Rate(mm_per_min) => dist_sq.sqrt() * 60_000.0 / mm_per_min,
                Feed::Duration(seconds) => seconds * 1000.0 / maxsteps as f64,
            };
            let elapsed_ms = self.clock.now_ms().saturating_sub(iteration_start) as f64;
            if budget_ms > elapsed_ms {
                self.clock.sleep_ms(budget_ms - elapsed_ms);
            }
        }

        if settings.release_after_move {
            self.driver.release_all();
        }
        Ok(())
    }

    /// Trace a circular arc from `position` to `target` around the absolute
    /// `center`, as a chain of straight segments on the selected plane.
    #[allow(clippy::too_many_arguments)]
    pub fn arc(
        &mut self,
        settings: &Settings,
        position: &mut [f64; 3],
        target: [f64; 3],
        center: [f64; 3],
        plane: Plane,
        feed: Feed,
        radius: f64,
        clockwise: bool,
    ) -> Result<(), LimitFault> {
        let i0 = plane.axis_0.index();
        let i1 = plane.axis_1.index();
        let il = plane.linear.index();

        let mut angle_start = atan3(position[i1] - center[i1], position[i0] - center[i0]);
        let mut angle_end = atan3(target[i1] - center[i1], target[i0] - center[i0]);

        // Resolve direction: clockwise sweeps are positive here, counter-
        // clockwise negative. A zero naive sweep (start == target) is a full
        // circle, not a no-op.
        let theta = angle_end - angle_start;
        if clockwise && theta <= 0.0 {
            angle_end += 2.0 * PI;
        } else if !clockwise && theta >= 0.0 {
            angle_start += 2.0 * PI;
        }
        let theta = angle_end - angle_start;

        let arc_length = theta.abs() * radius;
        // Segment density multiplies arc length, inherited behavior despite
        // the parameter's mm-per-segment name.
        let segments = (arc_length * settings.mm_per_arc_segment).ceil() as i64;

        tracing::debug!(theta, arc_length, segments, "arc interpolation");

        // An inverse-time feed covers the whole arc, so each chord gets an
        // equal share of it.
        let feed = match feed {
            Feed::Duration(seconds) => Feed::Duration(seconds / segments.max(1) as f64),
            rate => rate,
        };

        for i in 0..segments {
            let angle = angle_start + theta * i as f64 / segments as f64;
            let mut waypoint = *position;
            waypoint[i0] = center[i0] + angle.cos() * radius;
            waypoint[i1] = center[i1] + angle.sin() * radius;
            waypoint[il] = position[il];
            self.line(settings, position, waypoint, feed)?;
        }
        // Land on the exact target, not an interpolated point, so segment
        // rounding never accumulates into the endpoint.
        self.line(settings, position, target, feed)
    }

    /// Blocking pause, seconds.
    pub fn dwell(&mut self, seconds: f64) {
        tracing::debug!(seconds, "dwell");
        self.clock.sleep_ms(seconds * 1000.0);
    }

    /// Straight move back to program zero at the default feed rate.
    pub fn go_home(&mut self, settings: &Settings, position: &mut [f64; 3]) -> Result<(), LimitFault> {
        self.line(settings, position, [0.0; 3], Feed::Rate(settings.default_feed_rate))
    }

    /// Crawl each axis toward its minimum switch until all of them latch.
    /// Requires limit switches; without them this is a no-op.
    pub fn go_to_zero(&mut self, settings: &Settings, include_z: bool) {
        if !settings.limit_switch {
            return;
        }
        let axes: &[Axis] = if include_z { &Axis::ALL } else { &[Axis::X, Axis::Y] };
        let mut latched = [false; 3];
        loop {
            let mut all_latched = true;
            for &axis in axes {
                if latched[axis.index()] {
                    continue;
                }
                match self.one_step(settings, axis, Direction::Negative) {
                    Ok(()) => all_latched = false,
                    Err(_) => latched[axis.index()] = true,
                }
            }
            if all_latched {
                break;
            }
        }
    }

    /// Storage position: X against its minimum switch, Y against its
    /// maximum. Requires limit switches.
    pub fn park(&mut self, settings: &Settings) {
        if !settings.limit_switch {
            return;
        }
        let mut x_parked = false;
        let mut y_parked = false;
        while !(x_parked && y_parked) {
            if !x_parked && self.one_step(settings, Axis::X, Direction::Negative).is_err() {
                x_parked = true;
            }
            if !y_parked && self.one_step(settings, Axis::Y, Direction::Positive).is_err() {
                y_parked = true;
            }
        }
    }

    /// Measure the usable travel of every axis by stepping from the minimum
    /// switch to the maximum one, and record it in `work_area` (mm).
    pub fn calibrate(&mut self, settings: &mut Settings) {
        if !settings.limit_switch {
            return;
        }
        self.go_to_zero(settings, true);
        let mut counts = [0i64; 3];
        let mut latched = [false; 3];
        while !latched.iter().all(|&l| l) {
            for axis in Axis::ALL {
                let i = axis.index();
                if latched[i] {
                    continue;
                }
                match self.one_step(settings, axis, Direction::Positive) {
                    Ok(()) => counts[i] += 1,
                    Err(_) => latched[i] = true,
                }
            }
        }
        for i in 0..3 {
            settings.work_area[i] = counts[i] as f64 / settings.steps_per_mm[i];
        }
        tracing::info!(work_area = ?settings.work_area, "work area calibrated");
    }
}

/// atan2 normalized to [0, 2pi).
fn atan3(dy: f64, dx: f64) -> f64 {
    let a = dy.atan2(dx);
    if a < 0.0 { a + 2.0 * PI } else { a }
}
