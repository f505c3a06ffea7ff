use embassy_futures::select::{Either, select};
use embassy_stm32::exti::ExtiInput;
use embassy_time::{Instant, Timer};
use rover_core::debounce::SensorId;

use super::{Microphones, TELEMETRY};

/// Edge delivery and cooldown timer for one microphone line.
///
/// While the line is cooling the task sleeps on its timer instead of awaiting
/// edges, which is how the line's interrupt stays masked.
#[embassy_executor::task(pool_size = 4)]
pub async fn run(array: &'static Microphones, sensor: SensorId, mut input: ExtiInput<'static>) -> ! {
    loop {
        match select(input.wait_for_rising_edge(), array.timers().requested(sensor)).await {
            Either::First(()) => {
                if !array.lines().is_enabled(sensor) {
                    continue;
                }
                if let Some(detection) = array.on_edge(sensor) {
                    TELEMETRY.with(|telemetry| {
                        telemetry.record_detection(detection.sensor, detection.label, Instant::now())
                    });
                }
            }
            Either::Second(after) => {
                Timer::after(after).await;
                array.on_cooldown_expired(sensor);
            }
        }
    }
}
