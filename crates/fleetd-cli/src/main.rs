//! `fleetd` – the mission dispatch process.
//!
//! Connects the store watch streams and the MQTT broker to the per-robot
//! agents and runs until interrupted.  Exits with status 1 when the store
//! fails structurally; an external supervisor restarts the process and all
//! state is rehydrated from the store.

use std::sync::Arc;

use clap::{Parser, ValueEnum};
use tracing::{error, info};

use fleetd_broker::{MqttBroker, MqttConfig, MqttTransport};
use fleetd_server::{Dispatcher, DispatcherConfig};
use fleetd_store::HttpStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum TransportArg {
    Tcp,
    Websockets,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum LogLevel {
    Debug,
    Info,
    Warning,
    Error,
}

impl LogLevel {
    fn as_filter(self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warning => "warn",
            LogLevel::Error => "error",
        }
    }
}

/// VDA5050 mission dispatcher.
#[derive(Debug, Parser)]
#[command(name = "fleetd", version, about)]
struct Args {
    /// The hostname of the mqtt broker to connect to.
    #[arg(long = "mqtt_host", default_value = "localhost")]
    mqtt_host: String,

    /// The port of the mqtt broker to connect to.
    #[arg(long = "mqtt_port", default_value_t = 1883)]
    mqtt_port: u16,

    /// Transport mechanism: raw TCP or WebSockets.
    #[arg(long = "mqtt_transport", value_enum, default_value_t = TransportArg::Tcp)]
    mqtt_transport: TransportArg,

    /// The path for the websocket when --mqtt_transport is websockets.
    #[arg(long = "mqtt_ws_path")]
    mqtt_ws_path: Option<String>,

    /// The prefix to add to all VDA5050 mqtt topics.
    #[arg(long = "mqtt_prefix", default_value = "uagv/v2/RobotCompany")]
    mqtt_prefix: String,

    /// The url where the mission database REST API is hosted.
    #[arg(long = "database_url", default_value = "http://localhost:5000")]
    database_url: String,

    /// Base url of the optional mission-control service.
    #[arg(long = "mission_ctrl_url")]
    mission_ctrl_url: Option<String>,

    /// The minimum level of log messages to print.
    #[arg(long = "log_level", value_enum, default_value_t = LogLevel::Info)]
    log_level: LogLevel,
}

fn init_logging(level: LogLevel) {
    // RUST_LOG takes precedence over --log_level; FLEETD_LOG_FORMAT=json
    // switches to newline-delimited JSON for log aggregators.
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level.as_filter()));
    if std::env::var("FLEETD_LOG_FORMAT").as_deref() == Ok("json") {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_target(true)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_target(true)
            .compact()
            .init();
    }
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    init_logging(args.log_level);

    let store = HttpStore::new(args.database_url.clone());
    let broker = Arc::new(MqttBroker::connect(MqttConfig {
        host: args.mqtt_host.clone(),
        port: args.mqtt_port,
        transport: match args.mqtt_transport {
            TransportArg::Tcp => MqttTransport::Tcp,
            TransportArg::Websockets => MqttTransport::Websockets,
        },
        ws_path: args.mqtt_ws_path.clone(),
        prefix: args.mqtt_prefix.clone(),
        client_id: format!("fleetd-dispatch-{}", uuid::Uuid::new_v4()),
    }));

    info!(
        mqtt = %format!("{}:{}", args.mqtt_host, args.mqtt_port),
        prefix = %args.mqtt_prefix,
        database = %args.database_url,
        "starting mission dispatch"
    );

    let dispatcher = Dispatcher::new(
        store,
        broker,
        DispatcherConfig {
            mission_control_url: args.mission_ctrl_url,
        },
    );

    match dispatcher.run().await {
        Ok(()) => info!("dispatcher stopped"),
        Err(err) => {
            error!(error = %err, "unrecoverable store failure");
            std::process::exit(1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_surface() {
        let args = Args::parse_from(["fleetd"]);
        assert_eq!(args.mqtt_host, "localhost");
        assert_eq!(args.mqtt_port, 1883);
        assert_eq!(args.mqtt_transport, TransportArg::Tcp);
        assert_eq!(args.mqtt_prefix, "uagv/v2/RobotCompany");
        assert_eq!(args.database_url, "http://localhost:5000");
        assert_eq!(args.log_level, LogLevel::Info);
        assert!(args.mqtt_ws_path.is_none());
        assert!(args.mission_ctrl_url.is_none());
    }

    #[test]
    fn transport_and_level_parse() {
        let args = Args::parse_from([
            "fleetd",
            "--mqtt_transport",
            "websockets",
            "--mqtt_ws_path",
            "/mqtt",
            "--log_level",
            "debug",
        ]);
        assert_eq!(args.mqtt_transport, TransportArg::Websockets);
        assert_eq!(args.mqtt_ws_path.as_deref(), Some("/mqtt"));
        assert_eq!(args.log_level.as_filter(), "debug");
    }
}
