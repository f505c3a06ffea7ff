//! TIM2 PWM outputs driving the two H-bridge channels.
//!
//! Pins follow the board wiring: PA0 left reverse, PA1 left forward,
//! PA2 right reverse, PA3 right forward.

#![cfg(target_os = "none")]

use embassy_stm32::Peri;
use embassy_stm32::gpio::OutputType;
use embassy_stm32::peripherals::{PA0, PA1, PA2, PA3, TIM2};
use embassy_stm32::time::hz;
use embassy_stm32::timer::Channel;
use embassy_stm32::timer::low_level::CountingMode;
use embassy_stm32::timer::simple_pwm::{PwmPin, SimplePwm};
use rover_core::actuator::{DutyOutputs, MAX_DUTY, PolarityOutput};

use super::{pwm_channel_index, scale_duty};

/// H-bridge inputs switch slowly; the driver stage was tuned at 20 Hz.
const MOTOR_PWM_FREQ_HZ: u32 = 20;

const CHANNELS: [Channel; 4] = [Channel::Ch1, Channel::Ch2, Channel::Ch3, Channel::Ch4];

pub struct MotorPwm {
    pwm: SimplePwm<'static, TIM2>,
}

impl MotorPwm {
    pub fn new(
        timer: Peri<'static, TIM2>,
        left_reverse: Peri<'static, PA0>,
        left_forward: Peri<'static, PA1>,
        right_reverse: Peri<'static, PA2>,
        right_forward: Peri<'static, PA3>,
    ) -> Self {
        let mut pwm = SimplePwm::new(
            timer,
            Some(PwmPin::new(left_reverse, OutputType::PushPull)),
            Some(PwmPin::new(left_forward, OutputType::PushPull)),
            Some(PwmPin::new(right_reverse, OutputType::PushPull)),
            Some(PwmPin::new(right_forward, OutputType::PushPull)),
            hz(MOTOR_PWM_FREQ_HZ),
            CountingMode::EdgeAlignedUp,
        );

        for channel in CHANNELS {
            let mut output = pwm.channel(channel);
            output.set_duty_cycle(0);
            output.enable();
        }

        Self { pwm }
    }
}

impl DutyOutputs for MotorPwm {
    fn set_duty(&mut self, output: PolarityOutput, duty: u16) {
        let channel = CHANNELS[pwm_channel_index(output)];
        let timer_max = u32::from(self.pwm.max_duty_cycle());
        let compare = scale_duty(duty, MAX_DUTY, timer_max);
        self.pwm
            .channel(channel)
            .set_duty_cycle(u16::try_from(compare).unwrap_or(u16::MAX));
    }
}
