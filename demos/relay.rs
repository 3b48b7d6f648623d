//! Relay notifications from the wearable to the configured endpoint
//!
//! Run with: cargo run --example relay [central|requester]
//!
//! The endpoint and device name come from `GATEWAY_ENDPOINT_URL` and
//! `GATEWAY_DEVICE_SELECTOR`.

use ble_fall_gateway::{
    CentralTransport, ConfigHandle, Gateway, GatewayConfig, GatewayOptions,
    RequesterTransport, Result, Transport,
};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("ble_fall_gateway=debug"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let backend = std::env::args().nth(1).unwrap_or_else(|| "central".to_string());
    let config = ConfigHandle::new(GatewayConfig::from_env());

    println!("BLE Fall Gateway");
    println!("================\n");
    println!("Endpoint: {}", config.load().endpoint_url);
    println!("Device:   {}", config.load().device_selector);
    println!("Backend:  {}\n", backend);

    let central = CentralTransport::new().await?;
    let transport: Arc<dyn Transport> = match backend.as_str() {
        "requester" => Arc::new(RequesterTransport::new(central, config.clone())),
        _ => Arc::new(central),
    };

    let gateway = Gateway::with_http(transport, config, GatewayOptions::default())?;
    let _log = gateway.on_log(|entry| println!("{}", entry));
    let mut states = gateway.subscribe_state();

    gateway.connect().await;
    println!("Press Ctrl+C to exit.\n");

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                println!("\nExiting...");
                break;
            }
            changed = states.changed() => {
                if changed.is_err() {
                    break;
                }
                let state = *states.borrow_and_update();
                if state.is_terminal() {
                    match gateway.status().last_error {
                        Some(failure) => {
                            println!("Attempt failed ({}): {}", failure.kind, failure.message);
                        }
                        None => {
                            println!("Link lost, reconnecting...");
                            gateway.connect().await;
                        }
                    }
                }
            }
        }
    }

    gateway.shutdown().await;
    Ok(())
}
