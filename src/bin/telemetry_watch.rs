//! Telemetry Watch - live view of one aggregator window
//!
//! Seeds the window from the query endpoint, subscribes to the push endpoint
//! and logs every change until Ctrl-C.
//!
//! ## Usage
//!
//! ```bash
//! cargo run --bin telemetry_watch
//! cargo run --bin telemetry_watch -- --device dev-42
//! cargo run --bin telemetry_watch -- --send 21.5 40
//! cargo run --bin telemetry_watch -- --device dev-42 --send 21.5 40
//! ```
//!
//! ## Environment Variables
//!
//! - TELEMETRY_API_URL - Query endpoint base URL (default: http://localhost:8080)
//! - TELEMETRY_WS_URL - Push endpoint URL (default: ws://localhost:8080/ws/websocket)
//! - TELEMETRY_TOKEN - Bearer token (optional)
//! - TELEMETRY_DEVICE_ID - Device to watch (optional, default: all devices)
//! - BUFFER_CAPACITY - Window size (default: 50)
//! - RECONNECT_ENABLED - Restart failed subscriptions with backoff (default: false)
//! - RUST_LOG - Logging level (optional, default: info)

use std::env;
use std::sync::Arc;
use telemetry_stream::history::{StaticToken, TelemetryClient};
use telemetry_stream::{AggregatorConfig, Measurements, Scope, TelemetryAggregator};

fn arg_value(args: &[String], flag: &str) -> Option<String> {
    args.iter()
        .position(|x| x == flag)
        .and_then(|idx| args.get(idx + 1).cloned())
}

fn parse_send_args(args: &[String]) -> Result<Option<Measurements>, Box<dyn std::error::Error>> {
    let Some(idx) = args.iter().position(|x| x == "--send") else {
        return Ok(None);
    };

    let temperature = args
        .get(idx + 1)
        .ok_or("--send requires <temperature> <humidity>")?
        .parse::<f64>()?;
    let humidity = args
        .get(idx + 2)
        .ok_or("--send requires <temperature> <humidity>")?
        .parse::<f64>()?;

    Ok(Some(Measurements {
        temperature: Some(temperature),
        humidity: Some(humidity),
    }))
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv::dotenv().ok();

    let mut config = AggregatorConfig::from_env()?;

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(&config.rust_log))
        .target(env_logger::Target::Stderr)
        .init();

    let args: Vec<String> = env::args().collect();

    if let Some(device) = arg_value(&args, "--device") {
        config.scope = Scope::Device(device);
    }

    if let Some(measurements) = parse_send_args(&args)? {
        let client = TelemetryClient::new(
            &config.api_url,
            Arc::new(StaticToken(config.token.clone())),
            config.http_timeout,
        )?;
        match &config.scope {
            Scope::AllDevices => client.send_telemetry(&measurements).await?,
            Scope::Device(device) => {
                log::info!("Sending as device {} (identified by token)", device);
                client.send_device_telemetry(&measurements).await?
            }
        }
        return Ok(());
    }

    log::info!("🚀 Starting Telemetry Watch");
    log::info!("   Query endpoint: {}", config.api_url);
    log::info!("   Push endpoint: {}", config.ws_url);
    log::info!("   Scope: {}", config.scope);
    log::info!("   Window: {} readings", config.buffer_capacity);
    log::info!(
        "   Reconnect: {}",
        if config.reconnect.enabled { "enabled" } else { "disabled" }
    );

    let aggregator = TelemetryAggregator::from_config(&config)?;
    let handle = aggregator.open(config.scope.clone())?;

    let mut changes = handle.changes();
    let mut connection = handle.watch_connection();
    let mut last_error_seen = None;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                log::info!("🛑 Ctrl-C received, shutting down");
                break;
            }
            changed = changes.changed() => {
                if changed.is_err() {
                    break;
                }
                let snapshot = handle.snapshot();
                match snapshot.latest() {
                    Some(latest) => log::info!(
                        "📈 {} readings | latest {} @ {}: temperature={} humidity={}",
                        snapshot.len(),
                        latest.device_id,
                        latest.display_time(),
                        format_value(latest.temperature()),
                        format_value(latest.humidity()),
                    ),
                    None => log::info!("📈 Window is empty"),
                }
            }
            changed = connection.changed() => {
                if changed.is_err() {
                    break;
                }
                let state = *connection.borrow_and_update();
                log::info!("🔌 Connection {}", state.as_str());
            }
        }

        let last_error = handle.last_error();
        if last_error != last_error_seen {
            if let Some(err) = &last_error {
                log::warn!("⚠️  Last error: {}", err);
            }
            last_error_seen = last_error;
        }
    }

    handle.close();
    log::info!("✅ Final window: {} readings", handle.snapshot().len());
    Ok(())
}

fn format_value(value: Option<f64>) -> String {
    match value {
        Some(v) => format!("{:.2}", v),
        None => "-".to_string(),
    }
}
