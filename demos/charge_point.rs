//! Scripted charge point client for driving the sentinel proxy by hand.
//!
//! Run with: cargo run --example charge_point
//!
//! Connects to a running proxy, sends a signed BootNotification followed by
//! a few heartbeats, and prints every reply. The proxy address, charge
//! point id, and secret can be overridden via OCPP_PROXY_URI, OCPP_CP_ID,
//! and OCPP_SECRET.

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::connect_async;

use ocpp_sentinel::security::EnvelopeSigner;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let proxy_uri =
        std::env::var("OCPP_PROXY_URI").unwrap_or_else(|_| "ws://127.0.0.1:9090".to_string());
    let cp_id = std::env::var("OCPP_CP_ID").unwrap_or_else(|_| "CP_1".to_string());
    let secret = std::env::var("OCPP_SECRET").unwrap_or_else(|_| "SuperSecretKey123".to_string());

    let signer = EnvelopeSigner::new(secret.as_bytes(), 60);
    let url = format!("{}/{}", proxy_uri.trim_end_matches('/'), cp_id);

    println!("=== OCPP Sentinel demo charge point ===");
    println!("Connecting to {}", url);

    let (ws, _) = connect_async(url.as_str()).await?;
    let (mut write, mut read) = ws.split();

    // BootNotification first, as a well-behaved charge point would.
    let boot = json!([
        2,
        "boot-1",
        "BootNotification",
        {"chargePointVendor": "DemoVendor", "chargePointModel": "DemoModel-1000"}
    ])
    .to_string();
    write
        .send(Message::Text(signer.wrap(&boot).to_wire()?))
        .await?;
    println!("-> BootNotification sent");

    if let Some(Ok(Message::Text(reply))) = read.next().await {
        println!("<- {}", reply);
    }

    for i in 1..=3 {
        let heartbeat = json!([2, format!("hb-{}", i), "Heartbeat", {}]).to_string();
        write
            .send(Message::Text(signer.wrap(&heartbeat).to_wire()?))
            .await?;
        println!("-> Heartbeat {} sent", i);

        if let Some(Ok(Message::Text(reply))) = read.next().await {
            println!("<- {}", reply);
        }

        tokio::time::sleep(Duration::from_secs(2)).await;
    }

    write.send(Message::Close(None)).await?;
    println!("Done");

    Ok(())
}
