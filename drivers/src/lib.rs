#![no_std]
#![allow(unsafe_op_in_unsafe_fn)]

#[cfg(test)]
extern crate std;

pub mod digital_input;
pub mod digital_output;

#[cfg(test)]
mod test_fixtures;


pub use digital_input::{DigitalInputService, InputHandle, PinEvent};
pub use digital_output::{DigitalOutputService, OutputHandle};
