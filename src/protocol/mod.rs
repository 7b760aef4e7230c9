// src/protocol/mod.rs - serial-style line protocol: sanitize, dispatch, reply

use std::io::{BufRead, Write};
use std::path::PathBuf;

use thiserror::Error;

use crate::config::{Settings, SettingsError, SettingsReply};
use crate::gcode::{GcodeError, Interpreter};
use crate::hardware::{AxisDriver, Clock};
use crate::motion::MotionEngine;

/// Fixed line buffer size senders are written against. One slot is reserved
/// for the terminator, so 49 characters survive sanitization; the rest of
/// the line is dropped.
pub const LINE_BUFFER_SIZE: usize = 50;

#[derive(Debug, Error)]
pub enum LineError {
    #[error("{0}")]
    Gcode(#[from] GcodeError),
    #[error("{0}")]
    Settings(#[from] SettingsError),
}

/// Strip an incoming line down to the characters the interpreter accepts:
/// uppercase everything, drop whitespace and control characters, drop
/// `(...)` comments and block-delete lines starting with `/`, cap the length.
pub fn sanitize(line: &str) -> String {
    let mut out = String::new();
    let mut in_comment = false;
    for c in line.chars() {
        if out.len() >= LINE_BUFFER_SIZE - 1 {
            break;
        }
        match c {
            '(' => in_comment = true,
            ')' => in_comment = false,
            '/' => {} // block delete, ignored
            c if c <= ' ' => {}
            c if !in_comment => out.push(c.to_ascii_uppercase()),
            _ => {}
        }
    }
    out
}

/// Line-at-a-time front end tying settings, interpreter and motion together.
///
/// Every line gets exactly one reply, after the motion it commands has
/// physically finished. Senders rely on that ordering for flow control.
pub struct Protocol<D, C> {
    settings: Settings,
    settings_path: Option<PathBuf>,
    interp: Interpreter<D, C>,
}

impl<D: AxisDriver, C: Clock> Protocol<D, C> {
    pub fn new(settings: Settings, settings_path: Option<PathBuf>, engine: MotionEngine<D, C>) -> Self {
        let interp = Interpreter::new(&settings, engine);
        Self { settings, settings_path, interp }
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn interpreter(&self) -> &Interpreter<D, C> {
        &self.interp
    }

    fn persist(&self) -> Result<(), SettingsError> {
        match &self.settings_path {
            Some(path) => self.settings.save(path),
            None => Ok(()),
        }
    }

    /// Execute one raw line. `Ok(None)` is a plain acknowledge; `Ok(Some(_))`
    /// carries extra payload to print before the acknowledge.
    pub fn execute_line(&mut self, raw: &str) -> Result<Option<String>, LineError> {
        let line = sanitize(raw);
        if line.is_empty() {
            return Ok(None);
        }
        if line.starts_with('$') {
            match self.settings.execute_line(&line)? {
                SettingsReply::Dump(listing) => return Ok(Some(listing)),
                SettingsReply::Stored => self.persist()?,
                SettingsReply::Calibrate => {
                    self.interp.engine_mut().calibrate(&mut self.settings);
                    self.persist()?;
                }
            }
            return Ok(None);
        }
        self.interp.execute_line(&self.settings, &line)?;
        Ok(None)
    }

    /// Read lines from `input` until EOF, answering `ok` or `error: ...` on
    /// `output` for each.
    pub fn run<R: BufRead, W: Write>(&mut self, input: R, mut output: W) -> std::io::Result<()> {
        writeln!(output, "rustmill {}", env!("CARGO_PKG_VERSION"))?;
        writeln!(output, "'$$' to dump current settings")?;
        for line in input.lines() {
            let line = line?;
            match self.execute_line(&line) {
                Ok(payload) => {
                    if let Some(payload) = payload {
                        write!(output, "{payload}")?;
                    }
                    writeln!(output, "ok")?;
                }
                Err(e) => {
                    tracing::warn!(line, error = %e, "line rejected");
                    writeln!(output, "error: {e}")?;
                }
            }
            output.flush()?;
        }
        Ok(())
    }
}
