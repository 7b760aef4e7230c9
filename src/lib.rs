// src/lib.rs - rustmill: G-code interpreter and stepper motion engine

pub mod config;
pub mod gcode;
pub mod hardware;
pub mod motion;
pub mod protocol;
