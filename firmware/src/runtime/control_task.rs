use embassy_time::Instant;
use rover_core::actuator::ActuatorDriver;
use rover_core::dispatch::{CommandDispatcher, DriveConfig};
use rover_core::serial::PresenceEcho;

use super::{ECHO, PRESENCE, QUEUE, SESSIONS, TELEMETRY};
use crate::hw::motors::MotorPwm;
use crate::hw::{QueuedSerial, TimerPause};

/// Sole owner of the motor outputs.
#[embassy_executor::task]
pub async fn run(motors: MotorPwm) -> ! {
    let mut dispatcher = CommandDispatcher::new(
        ActuatorDriver::new(motors),
        TimerPause,
        PresenceEcho::new(&PRESENCE, QueuedSerial::new(&ECHO)),
        DriveConfig::default(),
    );
    defmt::info!("control: motors stopped, waiting for commands");

    dispatcher
        .run(&QUEUE, &SESSIONS, |report| {
            if report.replies_discarded > 0 {
                defmt::warn!(
                    "control: {} reply(ies) discarded, session gone",
                    report.replies_discarded
                );
            }
            let dropped = ECHO.take_dropped();
            if dropped > 0 {
                defmt::warn!("control: {} echo line(s) dropped, radio UART backed up", dropped);
            }
            TELEMETRY.with(|telemetry| telemetry.record_drain(&report, Instant::now()));
        })
        .await
}
