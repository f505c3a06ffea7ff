//! H-bridge actuator driver.
//!
//! Each motor channel owns a polarity pair: one PWM output that drives the
//! motor forward and one that drives it in reverse. The driver translates a
//! signed power intent into the pair of unsigned duties and guarantees that
//! the two outputs of a pair are never energized at the same time, including
//! between the individual duty writes of a single update.

use core::fmt;

/// Largest duty accepted by the 10-bit PWM outputs.
pub const MAX_DUTY: u16 = 1023;

/// Motor channel addressed by an intent.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum MotorId {
    Left,
    Right,
}

impl MotorId {
    /// Both channels in wire order (`m1`, `m2`).
    pub const ALL: [MotorId; 2] = [MotorId::Left, MotorId::Right];

    const fn index(self) -> usize {
        match self {
            MotorId::Left => 0,
            MotorId::Right => 1,
        }
    }
}

/// Direction driven by one output of a polarity pair.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Polarity {
    Forward,
    Reverse,
}

/// Addresses one physical PWM output.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct PolarityOutput {
    pub motor: MotorId,
    pub polarity: Polarity,
}

impl PolarityOutput {
    pub const fn new(motor: MotorId, polarity: Polarity) -> Self {
        Self { motor, polarity }
    }
}

/// Capability implemented by the PWM peripheral wrapper.
pub trait DutyOutputs {
    /// Sets the duty of a single output. `duty` never exceeds the configured maximum.
    fn set_duty(&mut self, output: PolarityOutput, duty: u16);
}

/// Signed power request for one motor.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct MotorIntent {
    pub motor_id: MotorId,
    pub signed_power: i32,
}

impl MotorIntent {
    pub const fn new(motor_id: MotorId, signed_power: i32) -> Self {
        Self {
            motor_id,
            signed_power,
        }
    }
}

/// Last commanded duties for one polarity pair.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct DutyPair {
    pub forward: u16,
    pub reverse: u16,
}

impl DutyPair {
    /// Both outputs off.
    pub const COAST: Self = Self {
        forward: 0,
        reverse: 0,
    };

    /// Builds the pair for a signed power, clamping the magnitude to `max_duty`.
    pub fn from_signed(signed_power: i32, max_duty: u16) -> Self {
        let magnitude = signed_power.unsigned_abs().min(u32::from(max_duty));
        // Clamped to a u16 maximum above.
        let magnitude = u16::try_from(magnitude).unwrap_or(max_duty);

        match signed_power.signum() {
            1 => Self {
                forward: magnitude,
                reverse: 0,
            },
            -1 => Self {
                forward: 0,
                reverse: magnitude,
            },
            _ => Self::COAST,
        }
    }

    /// Recovers the signed power from whichever output is active.
    pub fn signed(self) -> i32 {
        if self.forward != 0 {
            i32::from(self.forward)
        } else {
            -i32::from(self.reverse)
        }
    }

    /// Returns `true` when both outputs are nonzero, which must never happen.
    pub const fn is_shorted(self) -> bool {
        self.forward != 0 && self.reverse != 0
    }
}

/// Signed per-motor status reported to clients.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct MotorStatus {
    pub m1: i32,
    pub m2: i32,
}

impl fmt::Display for MotorStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{\"m1\": {}, \"m2\": {}}}", self.m1, self.m2)
    }
}

/// Raw output duties in legacy pin order: left reverse, left forward, right
/// reverse, right forward.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct PinDuties(pub [u16; 4]);

impl fmt::Display for PinDuties {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d] = self.0;
        write!(f, "({a}, {b}, {c}, {d})")
    }
}

/// Owns the motor outputs and the last commanded state.
///
/// Only the control loop holds an `ActuatorDriver`; it is never shared.
pub struct ActuatorDriver<O> {
    outputs: O,
    state: [DutyPair; 2],
    max_duty: u16,
}

impl<O: DutyOutputs> ActuatorDriver<O> {
    /// Wraps the outputs with the default duty ceiling and coasts every motor.
    pub fn new(outputs: O) -> Self {
        Self::with_max_duty(outputs, MAX_DUTY)
    }

    /// Wraps the outputs with an explicit duty ceiling and coasts every motor.
    pub fn with_max_duty(outputs: O, max_duty: u16) -> Self {
        let mut driver = Self {
            outputs,
            state: [DutyPair::COAST; 2],
            max_duty,
        };
        driver.write_all();
        driver
    }

    /// Returns the configured duty ceiling.
    pub const fn max_duty(&self) -> u16 {
        self.max_duty
    }

    /// Applies a single motor intent.
    pub fn apply(&mut self, intent: MotorIntent) {
        self.set_motor_power(intent.motor_id, intent.signed_power);
    }

    /// Sets one motor. Zero coasts, positive drives forward, negative reverse.
    pub fn set_motor_power(&mut self, motor: MotorId, signed_power: i32) {
        let next = DutyPair::from_signed(signed_power, self.max_duty);
        let previous = self.state[motor.index()];
        if previous == next {
            return;
        }

        let forward = PolarityOutput::new(motor, Polarity::Forward);
        let reverse = PolarityOutput::new(motor, Polarity::Reverse);

        // Release before engage.
        if next.forward == 0 {
            self.outputs.set_duty(forward, 0);
            self.outputs.set_duty(reverse, next.reverse);
        } else {
            self.outputs.set_duty(reverse, 0);
            self.outputs.set_duty(forward, next.forward);
        }

        self.state[motor.index()] = next;
    }

    /// Sets both motors, `m1` on the left channel and `m2` on the right.
    pub fn set_motor_powers(&mut self, m1: i32, m2: i32) {
        self.apply(MotorIntent::new(MotorId::Left, m1));
        self.apply(MotorIntent::new(MotorId::Right, m2));
    }

    /// Coasts every motor.
    pub fn stop_all(&mut self) {
        self.state = [DutyPair::COAST; 2];
        self.write_all();
    }

    /// Returns the last commanded duties for one motor.
    pub fn duty_pair(&self, motor: MotorId) -> DutyPair {
        self.state[motor.index()]
    }

    /// Returns the signed status of both motors.
    pub fn status(&self) -> MotorStatus {
        MotorStatus {
            m1: self.state[MotorId::Left.index()].signed(),
            m2: self.state[MotorId::Right.index()].signed(),
        }
    }

    /// Returns the raw duties in legacy pin order.
    pub fn pins(&self) -> PinDuties {
        let [left, right] = self.state;
        PinDuties([left.reverse, left.forward, right.reverse, right.forward])
    }

    /// Returns a reference to the wrapped outputs.
    pub fn outputs(&self) -> &O {
        &self.outputs
    }

    /// Consumes the driver and returns the outputs.
    pub fn into_inner(self) -> O {
        self.outputs
    }

    fn write_all(&mut self) {
        for motor in MotorId::ALL {
            let pair = self.state[motor.index()];
            self.outputs
                .set_duty(PolarityOutput::new(motor, Polarity::Forward), pair.forward);
            self.outputs
                .set_duty(PolarityOutput::new(motor, Polarity::Reverse), pair.reverse);
        }
    }
}
