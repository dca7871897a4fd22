//! HTTP gateway for Zigbee lights and valves reachable only over MQTT.
//!
//! Commands are fire-and-forget publishes to `<prefix>/<id>/set`. Status reads
//! are turned into bounded request/response calls by subscribing to the
//! device's state topic, publishing a get-request and waiting for the first
//! answer.

pub mod config;
pub mod devices;
pub mod dispatcher;
pub mod error;
pub mod gateway;
pub mod http;
pub mod mqtt;
pub mod query;
