#![no_std]
#![allow(unsafe_op_in_unsafe_fn)]

#[cfg(test)]
extern crate std;

pub mod alignment;
pub mod arena;
pub mod fault;
pub mod irqlock;
pub mod klog;
pub mod pin;
pub mod platform;
pub mod queue;


pub use alignment::{align_down_usize, align_up_usize};
pub use arena::{Arena, ArenaBacking};
pub use fault::{FaultCode, fault, register_fault_hook};
pub use irqlock::{IrqMutex, IrqMutexGuard};
pub use klog::{KlogLevel, klog_get_level, klog_register_backend, klog_set_level};
pub use pin::{Pin, PortIo, Sense};
pub use queue::Queue;
