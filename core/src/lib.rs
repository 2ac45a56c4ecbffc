#![no_std]
#![allow(unsafe_op_in_unsafe_fn)]

#[cfg(test)]
extern crate std;

pub mod reactor;
pub mod timer;

#[cfg(test)]
mod test_fixtures;

#[cfg(test)]
mod reactor_tests;
#[cfg(test)]
mod timer_tests;

pub use reactor::{Handle, Handler, Payload, Priority, Reactor};
pub use timer::{Tick, TimerInstance, TimerService};
