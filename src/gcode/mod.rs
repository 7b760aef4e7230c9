// src/gcode/mod.rs - RS274/NGC line interpreter and modal state machine

use thiserror::Error;

use crate::config::Settings;
use crate::hardware::{AxisDriver, Clock, LimitFault, SpindleDirection};
use crate::motion::{Feed, MotionEngine, Plane};

const MM_PER_INCH: f64 = 25.4;

/// Per-line status. Parsing stops at the first failure; steps already issued
/// by a faulted motion stay in effect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum GcodeError {
    #[error("Bad number format")]
    BadNumberFormat,
    #[error("Expected command letter")]
    ExpectedCommandLetter,
    #[error("Unsupported statement")]
    UnsupportedStatement,
    #[error("Floating point error")]
    FloatingPointError,
    #[error(transparent)]
    Limit(#[from] LimitFault),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MotionMode {
    #[default]
    Seek,
    Linear,
    ArcCw,
    ArcCcw,
    Cancel,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DistanceMode {
    #[default]
    Absolute,
    Relative,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UnitsMode {
    #[default]
    Millimeters,
    Inches,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FeedRateMode {
    /// F is mm/min (or inch/min under G20).
    #[default]
    UnitsPerMinute,
    /// F is total seconds for the move (G93).
    InverseTime,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ProgramFlow {
    #[default]
    Running,
    Paused,
    Completed,
}

/// Parser context that persists across lines until a command changes it.
#[derive(Debug, Clone)]
pub struct ModalState {
    pub motion_mode: MotionMode,
    pub distance_mode: DistanceMode,
    pub units_mode: UnitsMode,
    pub feed_rate_mode: FeedRateMode,
    pub plane: Plane,
    pub feed_rate: f64,
    pub seek_rate: f64,
    /// Where the interpreter believes the tool is. Matches the driver's true
    /// location whenever no motion is in progress.
    pub position: [f64; 3],
    pub spindle_speed: i32,
    pub spindle_direction: SpindleDirection,
    pub tool: u32,
    pub program_flow: ProgramFlow,
}

impl ModalState {
    pub fn new(settings: &Settings) -> Self {
        Self {
            motion_mode: MotionMode::default(),
            distance_mode: DistanceMode::default(),
            units_mode: UnitsMode::default(),
            feed_rate_mode: FeedRateMode::default(),
            plane: Plane::XY,
            feed_rate: settings.default_feed_rate,
            seek_rate: settings.default_seek_rate,
            position: [0.0; 3],
            spindle_speed: settings.default_spindle_speed,
            spindle_direction: SpindleDirection::Off,
            tool: 0,
            program_flow: ProgramFlow::default(),
        }
    }
}

/// One-shot action that replaces motion dispatch for the current line.
/// Produced by the command pass, consumed exactly once.
#[derive(Debug, Clone, Copy, PartialEq)]
enum Action {
    Dwell(f64),
    GoHome,
    SetOffset,
    ZeroAll,
    ZeroExceptZ,
    Park,
}

/// Executes sanitized G-code lines against a motion engine, one line at a
/// time. A motion call blocks until the move completes or a limit faults;
/// the caller must not feed the next line before the previous call returns.
pub struct Interpreter<D, C> {
    state: ModalState,
    engine: MotionEngine<D, C>,
}

impl<D: AxisDriver, C: Clock> Interpreter<D, C> {
    pub fn new(settings: &Settings, engine: MotionEngine<D, C>) -> Self {
        Self { state: ModalState::new(settings), engine }
    }

    pub fn state(&self) -> &ModalState {
        &self.state
    }

    pub fn engine(&self) -> &MotionEngine<D, C> {
        &self.engine
    }

    pub fn engine_mut(&mut self) -> &mut MotionEngine<D, C> {
        &mut self.engine
    }

    fn to_millimeters(&self, value: f64) -> f64 {
        match self.state.units_mode {
            UnitsMode::Inches => value * MM_PER_INCH,
            UnitsMode::Millimeters => value,
        }
    }

    /// Execute one sanitized line: uppercase, no whitespace, statements only.
    ///
    /// Two passes: commands (G/M/T) first, then parameters, then exactly one
    /// physical effect. Plane, units or mode switches with no axis words are
    /// legal lines with no motion.
    pub fn execute_line(&mut self, settings: &Settings, line: &str) -> Result<(), GcodeError> {
        tracing::debug!(line, "executing line");

        let mut action: Option<Action> = None;
        let mut absolute_override = false;

        // Pass 1: commands.
        let mut pos = 0;
        while let Some((letter, value)) = next_statement(line, &mut pos)? {
            let code = value.trunc() as i32;
            match letter {
                'G' => match code {
                    0 => self.state.motion_mode = MotionMode::Seek,
                    1 => self.state.motion_mode = MotionMode::Linear,
                    2 => self.state.motion_mode = MotionMode::ArcCw,
                    3 => self.state.motion_mode = MotionMode::ArcCcw,
                    4 => action = Some(Action::Dwell(0.0)),
                    17 => self.state.plane = Plane::XY,
                    18 => self.state.plane = Plane::XZ,
                    19 => self.state.plane = Plane::YZ,
                    20 => self.state.units_mode = UnitsMode::Inches,
                    21 => self.state.units_mode = UnitsMode::Millimeters,
                    28 | 30 => action = Some(Action::GoHome),
                    53 => absolute_override = true,
                    80 => self.state.motion_mode = MotionMode::Cancel,
                    90 => self.state.distance_mode = DistanceMode::Absolute,
                    91 => self.state.distance_mode = DistanceMode::Relative,
                    92 => action = Some(Action::SetOffset),
                    93 => self.state.feed_rate_mode = FeedRateMode::InverseTime,
                    94 => self.state.feed_rate_mode = FeedRateMode::UnitsPerMinute,
                    _ => return Err(GcodeError::UnsupportedStatement),
                },
                'M' => match code {
                    0 | 1 => self.state.program_flow = ProgramFlow::Paused,
                    2 | 30 | 60 => self.state.program_flow = ProgramFlow::Completed,
                    3 => self.state.spindle_direction = SpindleDirection::Cw,
                    4 => self.state.spindle_direction = SpindleDirection::Ccw,
                    5 => self.state.spindle_direction = SpindleDirection::Off,
                    // Manual-control extensions; the zero/park cycles need
                    // limit switches fitted.
                    100 => action = Some(Action::ZeroAll),
                    101 => action = Some(Action::ZeroExceptZ),
                    102 => action = Some(Action::Park),
                    _ => return Err(GcodeError::UnsupportedStatement),
                },
                'T' => self.state.tool = code.max(0) as u32,
                _ => {} // parameter letters are handled in pass 2
            }
        }

        // Pass 2: parameters, unit-converted under the modes pass 1 set.
        let mut target = self.state.position;
        let mut offset = [0.0f64; 3];
        let mut radius = 0.0f64;
        let mut radius_mode = false;
        let mut inverse_feed: Option<f64> = None;

        let mut pos = 0;
        while let Some((letter, value)) = next_statement(line, &mut pos)? {
            let unit_mm = self.to_millimeters(value);
            match letter {
                'F' => {
                    if unit_mm <= 0.0 {
                        return Err(GcodeError::BadNumberFormat);
                    }
                    match self.state.feed_rate_mode {
                        FeedRateMode::InverseTime => inverse_feed = Some(unit_mm),
                        FeedRateMode::UnitsPerMinute => {
                            if self.state.motion_mode == MotionMode::Seek {
                                self.state.seek_rate = unit_mm;
                            } else {
                                self.state.feed_rate = unit_mm;
                            }
                        }
                    }
                }
                'I' | 'J' | 'K' => offset[(letter as u8 - b'I') as usize] = unit_mm,
                'P' => {
                    if let Some(Action::Dwell(seconds)) = &mut action {
                        *seconds = value;
                    }
                }
                'R' => {
                    radius = unit_mm;
                    radius_mode = true;
                }
                'S' => self.state.spindle_speed = value as i32,
                'X' | 'Y' | 'Z' => {
                    let i = (letter as u8 - b'X') as usize;
                    if self.state.distance_mode == DistanceMode::Absolute || absolute_override {
                        target[i] = unit_mm;
                    } else {
                        target[i] += unit_mm;
                    }
                }
                // Commands were consumed in pass 1; unrecognized words
                // (line numbers among them) are tolerated, not errors.
                _ => {}
            }
        }

        // Both passes succeeded: apply the line's single physical effect.
        self.engine
            .driver_mut()
            .spindle(self.state.spindle_direction, self.state.spindle_speed);

        if let Some(action) = action {
            return self.run_action(settings, action, target);
        }

        let feed = match inverse_feed {
            Some(seconds) => Feed::Duration(seconds),
            None => Feed::Rate(self.state.feed_rate),
        };
        match self.state.motion_mode {
            // Canceled motion still resolves axis words into the modal
            // position so a later move starts from the right place.
            MotionMode::Cancel => self.state.position = target,
            MotionMode::Seek => {
                // Rapids always run at the seek rate, never inverse-timed.
                self.engine
                    .line(settings, &mut self.state.position, target, Feed::Rate(self.state.seek_rate))?;
                self.state.position = target;
            }
            MotionMode::Linear => {
                self.engine.line(settings, &mut self.state.position, target, feed)?;
                self.state.position = target;
            }
            MotionMode::ArcCw | MotionMode::ArcCcw => {
                let clockwise = self.state.motion_mode == MotionMode::ArcCw;
                self.run_arc(settings, target, offset, radius, radius_mode, feed, clockwise)?;
                self.state.position = target;
            }
        }
        Ok(())
    }

    fn run_action(&mut self, settings: &Settings, action: Action, target: [f64; 3]) -> Result<(), GcodeError> {
        match action {
            Action::Dwell(seconds) => self.engine.dwell(seconds),
            Action::GoHome => {
                self.engine.go_home(settings, &mut self.state.position)?;
                self.state.position = [0.0; 3];
            }
            Action::SetOffset => self.state.position = target,
            Action::ZeroAll => {
                self.engine.go_to_zero(settings, true);
                self.state.position = [0.0; 3];
            }
            Action::ZeroExceptZ => {
                self.engine.go_to_zero(settings, false);
                self.state.position[0] = 0.0;
                self.state.position[1] = 0.0;
            }
            Action::Park => self.engine.park(settings),
        }
        Ok(())
    }

    /// Shared arc preamble for G2/G3: derive the center, then trace.
    ///
    /// In radius mode the center sits at the signed perpendicular offset
    /// from the chord midpoint; a negative radius selects the over-180°
    /// solution. In offset mode I/J/K give the center relative to the
    /// current position and the radius follows from it.
    fn run_arc(
        &mut self,
        settings: &Settings,
        target: [f64; 3],
        mut offset: [f64; 3],
        mut radius: f64,
        radius_mode: bool,
        feed: Feed,
        clockwise: bool,
    ) -> Result<(), GcodeError> {
        let plane = self.state.plane;
        let i0 = plane.axis_0.index();
        let i1 = plane.axis_1.index();

        if radius_mode {
            let x = target[i0] - self.state.position[i0];
            let y = target[i1] - self.state.position[i1];
            // h_x2_div_d == -(2h / chord): the perpendicular from the chord
            // midpoint to the center, scaled by the chord length.
            let mut h_x2_div_d = -(4.0 * radius * radius - x * x - y * y).sqrt() / x.hypot(y);
            // NaN: the radius cannot reach the target. Infinite: zero-length
            // chord, center is unconstrained. Refuse both before any step.
            if !h_x2_div_d.is_finite() {
                return Err(GcodeError::FloatingPointError);
            }
            if !clockwise {
                h_x2_div_d = -h_x2_div_d;
            }
            if radius < 0.0 {
                h_x2_div_d = -h_x2_div_d;
                radius = -radius;
            }
            offset = [0.0; 3];
            offset[i0] = 0.5 * (x - y * h_x2_div_d);
            offset[i1] = 0.5 * (y + x * h_x2_div_d);
        } else {
            radius = offset[i0].hypot(offset[i1]);
        }

        let mut center = self.state.position;
        center[i0] += offset[i0];
        center[i1] += offset[i1];

        self.engine
            .arc(settings, &mut self.state.position, target, center, plane, feed, radius, clockwise)?;
        Ok(())
    }
}

/// Scan the next letter+number statement. Returns `Ok(None)` at end of line.
fn next_statement(line: &str, pos: &mut usize) -> Result<Option<(char, f64)>, GcodeError> {
    let bytes = line.as_bytes();
    if *pos >= bytes.len() {
        return Ok(None);
    }
    let letter = bytes[*pos] as char;
    if !letter.is_ascii_uppercase() {
        return Err(GcodeError::ExpectedCommandLetter);
    }
    *pos += 1;
    let value = read_float(line, pos).ok_or(GcodeError::BadNumberFormat)?;
    Ok(Some((letter, value)))
}

/// Read a signed decimal starting at `*pos`, advancing past it on success.
/// Accepts an `E` exponent with optional sign, as `strtod` does.
fn read_float(line: &str, pos: &mut usize) -> Option<f64> {
    let bytes = line.as_bytes();
    let start = *pos;
    let mut end = start;
    if end < bytes.len() && (bytes[end] == b'+' || bytes[end] == b'-') {
        end += 1;
    }
    while end < bytes.len() && (bytes[end].is_ascii_digit() || bytes[end] == b'.') {
        end += 1;
    }
    // An E is only an exponent when digits follow; otherwise it is left in
    // place as the next word.
    if end < bytes.len() && bytes[end] == b'E' {
        let mut exp = end + 1;
        if exp < bytes.len() && (bytes[exp] == b'+' || bytes[exp] == b'-') {
            exp += 1;
        }
        let digits_start = exp;
        while exp < bytes.len() && bytes[exp].is_ascii_digit() {
            exp += 1;
        }
        if exp > digits_start {
            end = exp;
        }
    }
    let value: f64 = line[start..end].parse().ok()?;
    *pos = end;
    Some(value)
}
