//! Core domain of the microphone monitor: capture interfaces, level
//! reduction, activity classification, publishing policy and settings.

pub mod domain;
