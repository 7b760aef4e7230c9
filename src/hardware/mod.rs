// src/hardware/mod.rs - axis driver seam: step actuation, limit switches, spindle, clock

use std::cell::Cell;
use std::fmt;
use std::time::Instant;

/// The three physical machine axes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Axis {
    X,
    Y,
    Z,
}

impl Axis {
    pub const ALL: [Axis; 3] = [Axis::X, Axis::Y, Axis::Z];

    pub fn index(self) -> usize {
        match self {
            Axis::X => 0,
            Axis::Y => 1,
            Axis::Z => 2,
        }
    }

    pub fn letter(self) -> char {
        match self {
            Axis::X => 'X',
            Axis::Y => 'Y',
            Axis::Z => 'Z',
        }
    }
}

/// Commanded travel direction along one axis.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Positive,
    Negative,
}

impl Direction {
    pub fn sign(self) -> i64 {
        match self {
            Direction::Positive => 1,
            Direction::Negative => -1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SpindleDirection {
    Cw,
    Ccw,
    #[default]
    Off,
}

/// An active limit switch in the commanded direction.
///
/// The numeric code keeps the wire format used by existing senders:
/// X max = 21, X min = 31, Y max = 41, Y min = 51, Z max = 61, Z min = 71.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LimitFault {
    pub axis: Axis,
    pub direction: Direction,
}

impl LimitFault {
    pub fn code(&self) -> u8 {
        let base = 21 + 20 * self.axis.index() as u8;
        match self.direction {
            Direction::Positive => base,
            Direction::Negative => base + 10,
        }
    }
}

impl fmt::Display for LimitFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let end = match self.direction {
            Direction::Positive => "End",
            Direction::Negative => "Start",
        };
        write!(f, "{} limit switch on {} axis enabled", end, self.axis.letter())
    }
}

impl std::error::Error for LimitFault {}

/// Low-level actuation primitive for the stepper drivers.
///
/// `limit` polls the switch for an (axis, direction) pair; `step` moves one
/// step unconditionally. The motion engine combines the two according to the
/// limit-switch setting, so implementations never consult configuration.
pub trait AxisDriver {
    /// Poll the limit switch guarding travel in `direction` on `axis`.
    fn limit(&self, axis: Axis, direction: Direction) -> Option<LimitFault>;

    /// Issue exactly one physical step.
    fn step(&mut self, axis: Axis, direction: Direction);

    /// De-energize holding torque on all motors. No-op where unsupported.
    fn release_all(&mut self);

    /// Update the spindle output. Implementations may skip the update when
    /// the direction is unchanged.
    fn spindle(&mut self, direction: SpindleDirection, speed: i32);
}

/// Monotonic time source used for feed-rate pacing.
pub trait Clock {
    fn now_ms(&self) -> u64;

    /// Blocking delay. Fractions of a millisecond are honored where the
    /// implementation can.
    fn sleep_ms(&self, ms: f64);
}

impl Clock for Box<dyn Clock> {
    fn now_ms(&self) -> u64 {
        (**self).now_ms()
    }

    fn sleep_ms(&self, ms: f64) {
        (**self).sleep_ms(ms)
    }
}

/// Wall-clock time via `std::time`.
pub struct SystemClock {
    start: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self { start: Instant::now() }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now_ms(&self) -> u64 {
        self.start.elapsed().as_millis() as u64
    }

    fn sleep_ms(&self, ms: f64) {
        if ms <= 0.0 {
            return;
        }
        // A non-finite or absurdly large budget must never take the process
        // down; an unrepresentable duration is skipped instead.
        if let Ok(duration) = std::time::Duration::try_from_secs_f64(ms / 1000.0) {
            std::thread::sleep(duration);
        }
    }
}

/// Virtual clock for dry runs and tests: sleeping advances simulated time
/// instantly.
#[derive(Default)]
pub struct SimClock {
    elapsed_ms: Cell<f64>,
}

impl SimClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn elapsed_ms(&self) -> f64 {
        self.elapsed_ms.get()
    }
}

impl Clock for SimClock {
    fn now_ms(&self) -> u64 {
        self.elapsed_ms.get() as u64
    }

    fn sleep_ms(&self, ms: f64) {
        if ms > 0.0 {
            self.elapsed_ms.set(self.elapsed_ms.get() + ms);
        }
    }
}

/// In-memory stepper driver.
///
/// Keeps per-axis step positions and an optional travel range; a step
/// commanded past either end of the range reads as an active limit switch.
/// Every issued step is logged so tests can assert on exact sequences.
pub struct SimDriver {
    steps: [i64; 3],
    travel: Option<[(i64, i64); 3]>,
    log: Vec<(Axis, Direction)>,
    spindle: (SpindleDirection, i32),
    released: bool,
}

impl SimDriver {
    /// Driver with no limit switches fitted.
    pub fn unbounded() -> Self {
        Self {
            steps: [0; 3],
            travel: None,
            log: Vec::new(),
            spindle: (SpindleDirection::Off, 0),
            released: false,
        }
    }

    /// Driver with limit switches at step 0 and at `max_steps` per axis.
    pub fn with_travel(max_steps: [i64; 3]) -> Self {
        let mut driver = Self::unbounded();
        driver.travel = Some([(0, max_steps[0]), (0, max_steps[1]), (0, max_steps[2])]);
        driver
    }

    /// Current position of `axis` in whole steps from its origin.
    pub fn steps(&self, axis: Axis) -> i64 {
        self.steps[axis.index()]
    }

    pub fn step_log(&self) -> &[(Axis, Direction)] {
        &self.log
    }

    pub fn total_steps(&self) -> usize {
        self.log.len()
    }

    pub fn spindle_state(&self) -> (SpindleDirection, i32) {
        self.spindle
    }

    pub fn is_released(&self) -> bool {
        self.released
    }

    /// Place the carriage at a given step position, e.g. mid-travel before a
    /// homing test.
    pub fn set_steps(&mut self, steps: [i64; 3]) {
        self.steps = steps;
    }
}

impl AxisDriver for SimDriver {
    fn limit(&self, axis: Axis, direction: Direction) -> Option<LimitFault> {
        let (min, max) = self.travel?[axis.index()];
        let at = self.steps[axis.index()];
        let tripped = match direction {
            Direction::Positive => at >= max,
            Direction::Negative => at <= min,
        };
        tripped.then_some(LimitFault { axis, direction })
    }

    fn step(&mut self, axis: Axis, direction: Direction) {
        self.steps[axis.index()] += direction.sign();
        self.log.push((axis, direction));
        self.released = false;
    }

    fn release_all(&mut self) {
        self.released = true;
    }

    fn spindle(&mut self, direction: SpindleDirection, speed: i32) {
        if direction != self.spindle.0 {
            tracing::debug!(?direction, speed, "spindle update");
        }
        self.spindle = (direction, speed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fault_codes_match_wire_format() {
        let code = |axis, direction| LimitFault { axis, direction }.code();
        assert_eq!(code(Axis::X, Direction::Positive), 21);
        assert_eq!(code(Axis::X, Direction::Negative), 31);
        assert_eq!(code(Axis::Y, Direction::Positive), 41);
        assert_eq!(code(Axis::Y, Direction::Negative), 51);
        assert_eq!(code(Axis::Z, Direction::Positive), 61);
        assert_eq!(code(Axis::Z, Direction::Negative), 71);
    }

    #[test]
    fn sim_driver_trips_limits_at_travel_ends() {
        let mut driver = SimDriver::with_travel([2, 2, 2]);
        assert!(driver.limit(Axis::X, Direction::Negative).is_some());
        assert!(driver.limit(Axis::X, Direction::Positive).is_none());
        driver.step(Axis::X, Direction::Positive);
        driver.step(Axis::X, Direction::Positive);
        assert_eq!(
            driver.limit(Axis::X, Direction::Positive),
            Some(LimitFault { axis: Axis::X, direction: Direction::Positive })
        );
        assert_eq!(driver.steps(Axis::X), 2);
    }

    #[test]
    fn system_clock_survives_unrepresentable_sleeps() {
        let clock = SystemClock::new();
        clock.sleep_ms(f64::INFINITY);
        clock.sleep_ms(f64::NAN);
        clock.sleep_ms(-5.0);
        clock.sleep_ms(1e300);
    }

    #[test]
    fn sim_clock_accumulates_sleeps() {
        let clock = SimClock::new();
        clock.sleep_ms(2.5);
        clock.sleep_ms(1.5);
        assert_eq!(clock.now_ms(), 4);
        clock.sleep_ms(-3.0);
        assert_eq!(clock.now_ms(), 4);
    }
}
