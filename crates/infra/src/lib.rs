//! Adapters binding the monitor's domain to real devices and a real broker.

pub mod audio;
pub mod mqtt;
