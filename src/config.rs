use serde::Deserialize;
use std::collections::HashSet;
use std::env;
use std::time::Duration;

use rumqttc::QoS;

use crate::devices::{DeviceClass, DeviceRecord};

#[derive(Debug, Clone)]
pub struct Config {
    pub mqtt: MqttConfig,
    pub http: HttpConfig,
    pub query_timeout: Duration,
    pub devices: Vec<DeviceRecord>,
}

#[derive(Debug, Clone)]
pub struct MqttConfig {
    pub broker_host: String,
    pub broker_port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    pub topic_prefix: String,
    pub client_id: String,
    pub qos: QoS,
    /// Upper bound for every publish/subscribe/unsubscribe/connect acknowledgment.
    pub ack_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct HttpConfig {
    pub port: u16,
    pub request_timeout: Duration,
    pub api_token: Option<String>,
}

// Serde struct for one entry of the device table file
#[derive(Deserialize)]
struct RawDevice {
    id: String,
    name: String,
    class: DeviceClass,
}

fn env_required(vars: &impl Fn(&str) -> Option<String>, key: &str) -> Result<String, String> {
    vars(key).ok_or_else(|| format!("{key} environment variable is required"))
}

fn env_optional(vars: &impl Fn(&str) -> Option<String>, key: &str) -> Option<String> {
    vars(key).filter(|v| !v.is_empty())
}

fn env_or_default<T: std::str::FromStr>(
    vars: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: T,
) -> T {
    vars(key)
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn parse_qos(level: u8) -> Result<QoS, String> {
    match level {
        0 => Ok(QoS::AtMostOnce),
        1 => Ok(QoS::AtLeastOnce),
        2 => Ok(QoS::ExactlyOnce),
        _ => Err(format!("MQTT_QOS must be 0, 1 or 2 (got {level})")),
    }
}

impl Config {
    pub fn from_env() -> Result<Self, String> {
        Self::load(&|key: &str| env::var(key).ok())
    }

    fn load(vars: &impl Fn(&str) -> Option<String>) -> Result<Self, String> {
        let devices_file = env_or_default(vars, "DEVICES_FILE", "devices.json".to_string());
        let content = std::fs::read_to_string(&devices_file)
            .map_err(|e| format!("Failed to read {devices_file}: {e}"))?;
        let devices = parse_devices(&content)
            .map_err(|e| format!("Failed to parse {devices_file}: {e}"))?;
        Self::from_parts(vars, devices)
    }

    fn from_parts(
        vars: &impl Fn(&str) -> Option<String>,
        devices: Vec<DeviceRecord>,
    ) -> Result<Self, String> {
        let config = Self {
            mqtt: MqttConfig {
                broker_host: env_required(vars, "MQTT_BROKER_HOST")?,
                broker_port: env_or_default(vars, "MQTT_BROKER_PORT", 1883),
                username: env_optional(vars, "MQTT_USERNAME"),
                password: env_optional(vars, "MQTT_PASSWORD"),
                topic_prefix: env_or_default(vars, "MQTT_TOPIC_PREFIX", "zigbee2mqtt".to_string()),
                client_id: env_or_default(vars, "MQTT_CLIENT_ID", "zigbee-gateway".to_string()),
                qos: parse_qos(env_or_default(vars, "MQTT_QOS", 0))?,
                ack_timeout: Duration::from_secs(env_or_default(vars, "MQTT_ACK_TIMEOUT_SECS", 5)),
            },
            http: HttpConfig {
                port: env_or_default(vars, "APP_PORT", 5000),
                request_timeout: Duration::from_secs(env_or_default(vars, "HTTP_TIMEOUT_SECS", 60)),
                api_token: env_optional(vars, "API_TOKEN"),
            },
            query_timeout: Duration::from_secs(env_or_default(vars, "QUERY_TIMEOUT_SECS", 30)),
            devices,
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), String> {
        if self.mqtt.broker_host.is_empty() {
            return Err("MQTT_BROKER_HOST must not be empty".into());
        }
        if self.mqtt.topic_prefix.is_empty() {
            return Err("MQTT_TOPIC_PREFIX must not be empty".into());
        }
        if self.mqtt.ack_timeout.is_zero() {
            return Err("MQTT_ACK_TIMEOUT_SECS must be > 0".into());
        }
        if self.query_timeout.is_zero() {
            return Err("QUERY_TIMEOUT_SECS must be > 0".into());
        }
        // The HTTP layer must never cut a status query off before its own deadline.
        if self.http.request_timeout <= self.query_timeout {
            return Err(format!(
                "HTTP_TIMEOUT_SECS ({}) must be greater than QUERY_TIMEOUT_SECS ({})",
                self.http.request_timeout.as_secs(),
                self.query_timeout.as_secs()
            ));
        }
        if self.devices.is_empty() {
            return Err("No devices found in devices file".into());
        }
        let mut seen = HashSet::new();
        for device in &self.devices {
            if device.logical_id.is_empty() {
                return Err("Device with empty 'id' in devices file".into());
            }
            if device.correlation_name.is_empty() {
                return Err(format!("Device {} has an empty 'name'", device.logical_id));
            }
            if !seen.insert(device.logical_id.as_str()) {
                return Err(format!("Duplicate device id {}", device.logical_id));
            }
        }
        Ok(())
    }
}

fn parse_devices(content: &str) -> Result<Vec<DeviceRecord>, serde_json::Error> {
    let raw_devices: Vec<RawDevice> = serde_json::from_str(content)?;
    Ok(raw_devices
        .into_iter()
        .map(|raw| DeviceRecord {
            logical_id: raw.id,
            correlation_name: raw.name,
            class: raw.class,
        })
        .collect())
}
