use cortex_m::interrupt;
use cortex_m::register::primask;
use critical_section::{self, RawRestoreState};
use defmt_rtt as _;
use embassy_executor::Spawner;
use embassy_stm32 as hal;
use embassy_stm32::exti::ExtiInput;
use embassy_stm32::gpio::Pull;
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use rover_core::debounce::{DebounceConfig, MICROPHONE_LABELS, SensorEventDebouncer, SensorId};
use rover_core::dispatch::{CommandQueue, QUEUE_DEPTH, QueueOrder};
use rover_core::session::{ChannelName, SessionRegistry};
use static_cell::StaticCell;

use crate::hw::motors::MotorPwm;
use crate::hw::{EchoOutbox, MIC_COUNT, MicLines, MicTimers, PresenceFlag};
use crate::telemetry::SharedTelemetry;
use crate::usb::{PortLink, UsbDeviceStorage, UsbTransport};

mod control_task;
mod sensor_task;
mod serial_task;
mod usb_task;

critical_section::set_impl!(InterruptCriticalSection);

struct InterruptCriticalSection;

unsafe impl critical_section::Impl for InterruptCriticalSection {
    unsafe fn acquire() -> RawRestoreState {
        let primask = primask::read();
        interrupt::disable();
        primask.is_active()
    }

    unsafe fn release(restore_state: RawRestoreState) {
        if restore_state {
            unsafe {
                interrupt::enable();
            }
        }
    }
}

pub(super) type Queue = CommandQueue<CriticalSectionRawMutex, QUEUE_DEPTH>;
pub(super) type Registry = SessionRegistry<CriticalSectionRawMutex, UsbTransport>;
pub(super) type Microphones = SensorEventDebouncer<MicLines, MicTimers, MIC_COUNT>;

pub(super) static QUEUE: Queue = Queue::new(QueueOrder::Fifo);
pub(super) static SESSIONS: Registry = Registry::new();
pub(super) static CONTROL_LINK: PortLink = PortLink::new();
pub(super) static TELEMETRY_LINK: PortLink = PortLink::new();
pub(super) static PRESENCE: PresenceFlag = PresenceFlag::new();
pub(super) static ECHO: EchoOutbox = EchoOutbox::new(&PRESENCE);
pub(super) static TELEMETRY: SharedTelemetry = SharedTelemetry::new();

static MICROPHONES: StaticCell<Microphones> = StaticCell::new();
pub(super) static USB_STORAGE: StaticCell<UsbDeviceStorage> = StaticCell::new();

pub(super) const fn port_link(channel: ChannelName) -> &'static PortLink {
    match channel {
        ChannelName::Control => &CONTROL_LINK,
        ChannelName::Telemetry => &TELEMETRY_LINK,
    }
}

#[embassy_executor::main]
pub async fn main(spawner: Spawner) {
    let config = hal::Config::default();
    let hal::Peripherals {
        TIM2,
        PA0,
        PA1,
        PA2,
        PA3,
        PA4,
        PA5,
        PA6,
        PA7,
        EXTI2,
        EXTI4,
        EXTI5,
        EXTI6,
        EXTI7,
        PB0,
        PB1,
        PB2,
        USB,
        PA11,
        PA12,
        USART5,
        ..
    } = hal::init(config);

    let motors = MotorPwm::new(TIM2, PA0, PA1, PA2, PA3);

    let microphones: &'static Microphones = MICROPHONES.init(SensorEventDebouncer::new(
        MICROPHONE_LABELS,
        MicLines::new(),
        MicTimers::new(),
        DebounceConfig::default(),
    ));

    spawner
        .spawn(control_task::run(motors))
        .expect("failed to spawn control task");

    spawner
        .spawn(usb_task::run(USB, PA12, PA11))
        .expect("failed to spawn USB task");

    spawner
        .spawn(serial_task::run(
            USART5,
            PB0,
            PB1,
            ExtiInput::new(PB2, EXTI2, Pull::Down),
        ))
        .expect("failed to spawn serial task");

    let mic_inputs = [
        ExtiInput::new(PA4, EXTI4, Pull::None),
        ExtiInput::new(PA5, EXTI5, Pull::None),
        ExtiInput::new(PA6, EXTI6, Pull::None),
        ExtiInput::new(PA7, EXTI7, Pull::None),
    ];
    for (id, input) in (0u8..).zip(mic_inputs) {
        spawner
            .spawn(sensor_task::run(microphones, SensorId(id), input))
            .expect("failed to spawn microphone task");
    }

    core::future::pending::<()>().await;
}
