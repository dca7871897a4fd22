use std::sync::Arc;

use tokio::net::TcpListener;
use tracing::{error, info};

use zigbee_gateway::config::Config;
use zigbee_gateway::devices::{Registry, TopicScheme};
use zigbee_gateway::gateway::Gateway;
use zigbee_gateway::http::{self, AppState};
use zigbee_gateway::mqtt::client::MqttClient;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let config = match Config::from_env() {
        Ok(c) => c,
        Err(e) => {
            error!("Configuration error: {}", e);
            std::process::exit(1);
        }
    };

    info!(
        "Starting zigbee gateway (mqtt={}:{}, prefix={}, devices={})",
        config.mqtt.broker_host,
        config.mqtt.broker_port,
        config.mqtt.topic_prefix,
        config.devices.len(),
    );

    for device in &config.devices {
        info!(
            "  {}: {} (state on {}/{})",
            device.class, device.logical_id, config.mqtt.topic_prefix, device.correlation_name,
        );
    }

    // MQTT client and its event loop (owns the connection, delivers subscriptions)
    let (mqtt_client, mqtt_eventloop) = MqttClient::new(&config.mqtt);
    let mqtt_handle = tokio::spawn(mqtt_eventloop.run());

    let gateway = Gateway::new(
        Arc::new(mqtt_client),
        Registry::new(config.devices.clone()),
        TopicScheme::new(config.mqtt.topic_prefix.clone()),
        config.mqtt.qos,
        config.query_timeout,
    );
    let state = AppState::new(Arc::new(gateway), config.http.api_token.clone());
    let app = http::router(state, config.http.request_timeout);

    let listener = match TcpListener::bind(("0.0.0.0", config.http.port)).await {
        Ok(l) => l,
        Err(e) => {
            error!("Failed to bind port {}: {}", config.http.port, e);
            std::process::exit(1);
        }
    };
    info!("HTTP server listening on port {}", config.http.port);

    if let Err(e) = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
    {
        error!("HTTP server error: {}", e);
    }

    mqtt_handle.abort();
    info!("zigbee gateway stopped");
}

async fn shutdown_signal() {
    let sigterm = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to register SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received SIGINT, shutting down");
        }
        _ = sigterm => {
            info!("Received SIGTERM, shutting down");
        }
    }
}
