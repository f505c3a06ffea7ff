//! Closed command vocabulary shared by every command source.

use core::fmt;

/// Parameter shape a verb accepts.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ParamKind {
    /// Any parameter is ignored.
    None,
    /// A parameter overrides the default when present.
    Optional,
    /// The command is malformed without a parameter.
    Required,
}

/// Every action a command source may request.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum Verb {
    Stop,
    Forward,
    Backward,
    RotateLeft,
    RotateRight,
    TurnLeft,
    TurnRight,
    Wait,
    Wait1s,
    Wait5s,
    SetGlobalPower,
    GetGlobalPower,
    SetMotorPowers,
    GetPinsStatus,
    GetStatus,
}

impl Verb {
    pub const ALL: [Verb; 15] = [
        Verb::Stop,
        Verb::Forward,
        Verb::Backward,
        Verb::RotateLeft,
        Verb::RotateRight,
        Verb::TurnLeft,
        Verb::TurnRight,
        Verb::Wait,
        Verb::Wait1s,
        Verb::Wait5s,
        Verb::SetGlobalPower,
        Verb::GetGlobalPower,
        Verb::SetMotorPowers,
        Verb::GetPinsStatus,
        Verb::GetStatus,
    ];

    /// Canonical wire name.
    pub const fn name(self) -> &'static str {
        match self {
            Verb::Stop => "Stop",
            Verb::Forward => "Forward",
            Verb::Backward => "Backward",
            Verb::RotateLeft => "RotateLeft",
            Verb::RotateRight => "RotateRight",
            Verb::TurnLeft => "TurnLeft",
            Verb::TurnRight => "TurnRight",
            Verb::Wait => "Wait",
            Verb::Wait1s => "Wait1s",
            Verb::Wait5s => "Wait5s",
            Verb::SetGlobalPower => "SetGlobalPower",
            Verb::GetGlobalPower => "GetGlobalPower",
            Verb::SetMotorPowers => "SetMotorPowers",
            Verb::GetPinsStatus => "GetPinsStatus",
            Verb::GetStatus => "GetStatus",
        }
    }

    /// Snake-case spelling used by older clients.
    pub const fn legacy_name(self) -> &'static str {
        match self {
            Verb::Stop => "stop",
            Verb::Forward => "forward",
            Verb::Backward => "backward",
            Verb::RotateLeft => "rotate_left",
            Verb::RotateRight => "rotate_right",
            Verb::TurnLeft => "turn_left",
            Verb::TurnRight => "turn_right",
            Verb::Wait => "wait",
            Verb::Wait1s => "wait_1s",
            Verb::Wait5s => "wait_5s",
            Verb::SetGlobalPower => "set_power",
            Verb::GetGlobalPower => "get_power",
            Verb::SetMotorPowers => "set_motor_powers",
            Verb::GetPinsStatus => "get_pins_status",
            Verb::GetStatus => "get_motors_status",
        }
    }

    /// Resolves either spelling. Matching is exact.
    pub fn from_wire_name(name: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|verb| verb.name() == name || verb.legacy_name() == name)
    }

    pub const fn param_kind(self) -> ParamKind {
        match self {
            Verb::Forward
            | Verb::Backward
            | Verb::RotateLeft
            | Verb::RotateRight
            | Verb::TurnLeft
            | Verb::TurnRight
            | Verb::Wait => ParamKind::Optional,
            Verb::SetGlobalPower | Verb::SetMotorPowers => ParamKind::Required,
            Verb::Stop
            | Verb::Wait1s
            | Verb::Wait5s
            | Verb::GetGlobalPower
            | Verb::GetPinsStatus
            | Verb::GetStatus => ParamKind::None,
        }
    }

    pub const fn requires_param(self) -> bool {
        matches!(self.param_kind(), ParamKind::Required)
    }

    /// Drive pattern for timed motion verbs.
    pub const fn motion(self) -> Option<Motion> {
        match self {
            Verb::Forward => Some(Motion::Forward),
            Verb::Backward => Some(Motion::Backward),
            Verb::RotateLeft => Some(Motion::RotateLeft),
            Verb::RotateRight => Some(Motion::RotateRight),
            Verb::TurnLeft => Some(Motion::TurnLeft),
            Verb::TurnRight => Some(Motion::TurnRight),
            _ => None,
        }
    }
}

impl fmt::Display for Verb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Fixed two-wheel drive patterns.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Motion {
    Forward,
    Backward,
    RotateLeft,
    RotateRight,
    TurnLeft,
    TurnRight,
}

impl Motion {
    /// Signed `(m1, m2)` powers for power level `power`.
    pub const fn powers(self, power: i32) -> (i32, i32) {
        match self {
            Motion::Forward => (power, power),
            Motion::Backward => (-power, -power),
            Motion::RotateLeft => (-power, power),
            Motion::RotateRight => (power, -power),
            Motion::TurnLeft => (0, power),
            Motion::TurnRight => (power, 0),
        }
    }

    /// Rotations and turns use the shorter default hold.
    pub const fn is_pivot(self) -> bool {
        !matches!(self, Motion::Forward | Motion::Backward)
    }
}

/// How long a motion pulse keeps the motors engaged.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Hold {
    /// Pause for the given milliseconds, then stop.
    For(u32),
    /// Leave the motors running.
    Continuous,
}

impl Hold {
    /// Interprets a hold parameter. Negative values (conventionally `-1`)
    /// mean "keep driving".
    pub fn from_param(param: Option<i32>, default_ms: u32) -> Self {
        match param {
            None => Hold::For(default_ms),
            Some(ms) => u32::try_from(ms).map_or(Hold::Continuous, Hold::For),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn both_spellings_resolve() {
        for verb in Verb::ALL {
            assert_eq!(Verb::from_wire_name(verb.name()), Some(verb));
            assert_eq!(Verb::from_wire_name(verb.legacy_name()), Some(verb));
        }
        assert_eq!(Verb::from_wire_name("get_motors_status"), Some(Verb::GetStatus));
        assert_eq!(Verb::from_wire_name("Dance"), None);
        assert_eq!(Verb::from_wire_name("FORWARD"), None);
    }

    #[test]
    fn motion_patterns_match_drive_table() {
        assert_eq!(Motion::Forward.powers(1000), (1000, 1000));
        assert_eq!(Motion::Backward.powers(1000), (-1000, -1000));
        assert_eq!(Motion::RotateLeft.powers(700), (-700, 700));
        assert_eq!(Motion::RotateRight.powers(700), (700, -700));
        assert_eq!(Motion::TurnLeft.powers(300), (0, 300));
        assert_eq!(Motion::TurnRight.powers(300), (300, 0));
    }

    #[test]
    fn negative_hold_is_continuous() {
        assert_eq!(Hold::from_param(None, 500), Hold::For(500));
        assert_eq!(Hold::from_param(Some(120), 500), Hold::For(120));
        assert_eq!(Hold::from_param(Some(-1), 500), Hold::Continuous);
        assert_eq!(Hold::from_param(Some(0), 500), Hold::For(0));
    }
}
