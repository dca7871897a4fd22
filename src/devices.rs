//! Device table: logical ids, correlation names and the topics derived from them.
//!
//! Commands and get-requests are addressed by logical id
//! (`<prefix>/<id>/set`, `<prefix>/<id>/get`), while devices publish their
//! own state under their correlation name (`<prefix>/<name>`).

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::GatewayError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceClass {
    Light,
    Valve,
}

impl DeviceClass {
    /// Parse the class segment of a request path ("light", "lights", "valve", "valves").
    pub fn from_path_segment(segment: &str) -> Option<Self> {
        match segment.to_ascii_lowercase().as_str() {
            "light" | "lights" => Some(Self::Light),
            "valve" | "valves" => Some(Self::Valve),
            _ => None,
        }
    }

    pub fn actions(self) -> &'static [&'static str] {
        match self {
            Self::Light => &["on", "off", "toggle"],
            Self::Valve => &["on", "off"],
        }
    }

    pub fn accepts(self, action: &str) -> bool {
        self.actions()
            .iter()
            .any(|a| a.eq_ignore_ascii_case(action))
    }

    /// Fields asked for in a get-request. Empty values mean "report current".
    pub fn query_fields(self) -> &'static [&'static str] {
        match self {
            Self::Light => &["state"],
            // Valves also report battery level and water flow
            Self::Valve => &["state", "battery", "flow"],
        }
    }

    pub fn get_request_payload(self) -> Value {
        let fields: Map<String, Value> = self
            .query_fields()
            .iter()
            .map(|f| (f.to_string(), Value::String(String::new())))
            .collect();
        Value::Object(fields)
    }
}

impl fmt::Display for DeviceClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Light => f.write_str("Light"),
            Self::Valve => f.write_str("Valve"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeviceRecord {
    #[serde(rename = "id")]
    pub logical_id: String,
    #[serde(rename = "name")]
    pub correlation_name: String,
    pub class: DeviceClass,
}

/// Immutable device table, built once at startup.
#[derive(Debug, Clone, Default)]
pub struct Registry {
    devices: Vec<DeviceRecord>,
}

impl Registry {
    pub fn new(devices: Vec<DeviceRecord>) -> Self {
        Self { devices }
    }

    pub fn resolve(&self, logical_id: &str) -> Result<&DeviceRecord, GatewayError> {
        self.devices
            .iter()
            .find(|d| d.logical_id == logical_id)
            .ok_or_else(|| GatewayError::UnknownDevice(logical_id.to_string()))
    }

    pub fn is_known(&self, logical_id: &str) -> bool {
        self.resolve(logical_id).is_ok()
    }

    pub fn correlation_name_for(&self, logical_id: &str) -> Result<&str, GatewayError> {
        self.resolve(logical_id)
            .map(|d| d.correlation_name.as_str())
    }

    pub fn devices(&self) -> &[DeviceRecord] {
        &self.devices
    }
}

/// Topic templates under one namespace.
#[derive(Debug, Clone)]
pub struct TopicScheme {
    namespace: String,
}

impl TopicScheme {
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
        }
    }

    pub fn control(&self, device: &DeviceRecord) -> String {
        format!("{}/{}/set", self.namespace, device.logical_id)
    }

    pub fn get_request(&self, device: &DeviceRecord) -> String {
        format!("{}/{}/get", self.namespace, device.logical_id)
    }

    pub fn state(&self, device: &DeviceRecord) -> String {
        format!("{}/{}", self.namespace, device.correlation_name)
    }
}
