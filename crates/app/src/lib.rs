//! Monitor application: startup and shutdown sequencing, the per-channel
//! sampling cycles, device selection and the terminal dashboard.

pub mod devices;
pub mod orchestrator;
pub mod ui;
