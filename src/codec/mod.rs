//! Component A: the event envelope's on-disk frame encoding.

pub mod frame;

pub use frame::*;
