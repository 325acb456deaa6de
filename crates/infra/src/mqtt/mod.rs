//! MQTT session management using rumqttc
//!
//! The broker session is driven by a background task polling the rumqttc
//! event loop. Its outcomes are translated into link events for the domain's
//! connection tracker; publishing goes through the domain's outbox policy.

pub mod publisher;

pub use publisher::*;
