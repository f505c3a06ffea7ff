#![cfg_attr(not(test), no_std)]

// Concurrency and arbitration core for the two-motor rover.
//
// The crate stays portable across the MCU firmware and the host emulator by
// avoiding the Rust standard library. Hardware and transports enter through
// small capability traits so every component can be exercised with fakes.

pub mod actuator;
pub mod debounce;
pub mod dispatch;
pub mod protocol;
pub mod serial;
pub mod session;
