// tests/protocol.rs - end-to-end runs through the line protocol

use rustmill::config::Settings;
use rustmill::hardware::{Axis, SimClock, SimDriver};
use rustmill::motion::MotionEngine;
use rustmill::protocol::Protocol;

fn protocol_with(settings: Settings) -> Protocol<SimDriver, SimClock> {
    let driver = if settings.limit_switch {
        let max_steps =
            std::array::from_fn(|i| (settings.work_area[i] * settings.steps_per_mm[i]).round() as i64);
        SimDriver::with_travel(max_steps)
    } else {
        SimDriver::unbounded()
    };
    let engine = MotionEngine::new(driver, SimClock::new());
    Protocol::new(settings, None, engine)
}

fn protocol() -> Protocol<SimDriver, SimClock> {
    let mut settings = Settings::default();
    settings.steps_per_mm = [10.0, 10.0, 10.0];
    settings.release_after_move = false;
    protocol_with(settings)
}

fn run_program(protocol: &mut Protocol<SimDriver, SimClock>, program: &str) -> Vec<String> {
    let mut output = Vec::new();
    protocol.run(program.as_bytes(), &mut output).unwrap();
    String::from_utf8(output)
        .unwrap()
        .lines()
        .skip(2) // greeting
        .map(str::to_owned)
        .collect()
}

#[test]
fn square_program_returns_to_origin() {
    let mut protocol = protocol();
    let replies = run_program(
        &mut protocol,
        "G90 G21\n\
         G1 X10 F600\n\
         G1 Y10\n\
         G1 X0\n\
         G1 Y0\n",
    );
    assert!(replies.iter().all(|r| r == "ok"), "{replies:?}");
    assert_eq!(protocol.interpreter().state().position, [0.0, 0.0, 0.0]);
    assert_eq!(protocol.interpreter().engine().driver().steps(Axis::X), 0);
    assert_eq!(protocol.interpreter().engine().driver().steps(Axis::Y), 0);
    // 4 edges of 10 mm at 10 steps/mm.
    assert_eq!(protocol.interpreter().engine().driver().total_steps(), 400);
}

#[test]
fn circle_of_two_arcs_returns_to_start() {
    let mut protocol = protocol();
    let replies = run_program(
        &mut protocol,
        "G1 X10 F600\n\
         G2 X-10 I-10 J0\n\
         G2 X10 I10 J0\n",
    );
    assert!(replies.iter().all(|r| r == "ok"), "{replies:?}");
    let position = protocol.interpreter().state().position;
    assert_eq!(position, [10.0, 0.0, 0.0]);
    assert!(protocol.interpreter().engine().driver().steps(Axis::X).abs() <= 100 + 1);
    assert!(protocol.interpreter().engine().driver().steps(Axis::Z) == 0);
}

#[test]
fn comments_and_casing_are_tolerated() {
    let mut protocol = protocol();
    let replies = run_program(&mut protocol, "g1 x5 (rough cut) y5 f600\n   \n");
    assert_eq!(replies, vec!["ok", "ok"]);
    assert_eq!(protocol.interpreter().state().position, [5.0, 5.0, 0.0]);
}

#[test]
fn bad_lines_report_errors_and_do_not_stop_the_session() {
    let mut protocol = protocol();
    let replies = run_program(
        &mut protocol,
        "G99\n\
         G1 X2 F600\n\
         G1 X\n\
         G1 X4\n",
    );
    assert_eq!(
        replies,
        vec![
            "error: Unsupported statement",
            "ok",
            "error: Bad number format",
            "ok",
        ]
    );
    assert_eq!(protocol.interpreter().state().position[0], 4.0);
}

#[test]
fn settings_flow_changes_later_motion() {
    let mut protocol = protocol();
    // Halve the resolution, then move; the same distance takes fewer steps.
    let replies = run_program(
        &mut protocol,
        "$4=5\n$5=5\n$6=5\n\
         G1 X10 F600\n",
    );
    assert!(replies.iter().all(|r| r == "ok"), "{replies:?}");
    assert_eq!(protocol.interpreter().engine().driver().steps(Axis::X), 50);
}

#[test]
fn settings_dump_precedes_the_acknowledge() {
    let mut protocol = protocol();
    let replies = run_program(&mut protocol, "$$\n");
    assert!(replies.first().is_some_and(|r| r.starts_with("$0 = ")));
    assert_eq!(replies.last().map(String::as_str), Some("ok"));
}

#[test]
fn limit_fault_reports_and_allows_recovery() {
    let mut settings = Settings::default();
    settings.steps_per_mm = [10.0, 10.0, 10.0];
    settings.limit_switch = true;
    settings.work_area = [5.0, 5.0, 5.0];
    let mut protocol = protocol_with(settings);

    let replies = run_program(
        &mut protocol,
        "G1 X10 F600\n\
         G1 X2\n",
    );
    assert_eq!(
        replies,
        vec!["error: End limit switch on X axis enabled", "ok"]
    );
    // The fault left the carriage at the switch; recovery is relative to the
    // true position.
    assert_eq!(protocol.interpreter().state().position[0], 5.0);
    assert_eq!(protocol.interpreter().engine().driver().steps(Axis::X), 20);
}

#[test]
fn inch_program_is_interpreted_in_millimeters() {
    let mut protocol = protocol();
    let replies = run_program(&mut protocol, "G20\nG1 X1 F60\n");
    assert!(replies.iter().all(|r| r == "ok"), "{replies:?}");
    assert_eq!(protocol.interpreter().engine().driver().steps(Axis::X), 254);
}
