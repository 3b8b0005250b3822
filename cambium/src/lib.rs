#![warn(clippy::pedantic)]
#![warn(missing_docs)]
#![warn(unreachable_pub)]
#![doc = include_str!("../README.md")]
//!
//! # Threading Notes
//!
//! Lane-confined operations panic when called from the wrong thread rather
//! than corrupting state. Submission APIs ([`Lane::schedule`],
//! [`Lane::schedule_after`], [`Lane::call`]) are callable from any thread.

pub mod confined;
pub mod lane;

pub use confined::Confined;
pub use lane::{Lane, Sleep, TaskHandle, TimerHandle};

#[doc = include_str!("../README.md")]
mod readme {}
