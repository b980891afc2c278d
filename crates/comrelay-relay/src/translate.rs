//! Inbound event to outbound command translation
//!
//! Pure functions; `None` means the input is not recognized. Command grammar:
//!
//! | Input | Command |
//! |---|---|
//! | pose (7 numeric args) | `pose/[[x,y,z],[qw,qx,qy,qz]];` |
//! | joints (at least 6 numeric args) | `joints/[a0,a1,a2,a3,a4,a5,[0,0,0,0,0,0]];` |
//! | home | `GoHome/;` |
//! | draw circle | `do_draw_circle/;` |
//! | named position | `PosA;/` |
//! | fader | `<name>/<value>;` |

use comrelay_bridge::MidiMessage;
use rosc::OscType;

use crate::config::{FaderEntry, OscRoutes};

pub const HOME_COMMAND: &str = "GoHome/;";
pub const DRAW_CIRCLE_COMMAND: &str = "do_draw_circle/;";
pub const NAMED_POSITION_COMMAND: &str = "PosA;/";

const JOINT_COUNT: usize = 6;
const EXTERNAL_AXES: &str = "[0,0,0,0,0,0]";

/// Shortest text for a numeric argument. Whole floats drop the fraction.
pub fn format_number(arg: &OscType) -> Option<String> {
    match arg {
        OscType::Int(i) => Some(i.to_string()),
        OscType::Long(l) => Some(l.to_string()),
        OscType::Float(f) if f.is_finite() => Some(if is_whole(*f as f64) {
            format!("{}", *f as i64)
        } else {
            f.to_string()
        }),
        OscType::Double(d) if d.is_finite() => Some(if is_whole(*d) {
            format!("{}", *d as i64)
        } else {
            d.to_string()
        }),
        _ => None,
    }
}

fn is_whole(v: f64) -> bool {
    v.fract() == 0.0 && v.abs() < 1e15
}

/// Format the first `n` arguments, or `None` if there are fewer or any is
/// not numeric
fn numbers(args: &[OscType], n: usize) -> Option<Vec<String>> {
    if args.len() < n {
        return None;
    }
    args[..n].iter().map(format_number).collect()
}

/// `x, y, z, qx, qy, qz, qw` becomes `pose/[[x,y,z],[qw,qx,qy,qz]];`
pub fn pose_command(args: &[OscType]) -> Option<String> {
    let n = numbers(args, 7)?;
    Some(format!(
        "pose/[[{},{},{}],[{},{},{},{}]];",
        n[0], n[1], n[2], n[6], n[3], n[4], n[5]
    ))
}

/// Six joint angles; anything past the sixth is ignored
pub fn joints_command(args: &[OscType]) -> Option<String> {
    let n = numbers(args, JOINT_COUNT)?;
    Some(format!("joints/[{},{}];", n.join(","), EXTERNAL_AXES))
}

pub fn osc_command(routes: &OscRoutes, address: &str, args: &[OscType]) -> Option<String> {
    if address == routes.pose {
        pose_command(args)
    } else if address == routes.joints {
        joints_command(args)
    } else if address == routes.home {
        Some(HOME_COMMAND.to_string())
    } else if address == routes.draw_circle {
        Some(DRAW_CIRCLE_COMMAND.to_string())
    } else if address == routes.named_position {
        Some(NAMED_POSITION_COMMAND.to_string())
    } else {
        None
    }
}

/// Control changes on a mapped controller become `<name>/<value>;`
pub fn midi_command(faders: &[FaderEntry], message: &MidiMessage) -> Option<String> {
    let MidiMessage::ControlChange {
        controller, value, ..
    } = *message
    else {
        return None;
    };

    faders
        .iter()
        .find(|f| f.controller == controller)
        .map(|f| format!("{}/{};", f.command, value))
}
