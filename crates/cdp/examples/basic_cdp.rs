//! Basic CDP example - connecting, getting browser version, watching targets

use cdp::{Browser, BrowserConfig, TargetEvent};
use serde_json::json;
use std::time::Duration;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::fmt::init();

    // Connect to Chrome
    let ws_url = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "ws://localhost:9222/devtools/browser".to_string());
    println!("Connecting to Chrome at: {}", ws_url);

    let browser = Browser::connect(BrowserConfig::new(ws_url)).await?;
    println!("Connected!");

    let version = browser.version().await?;
    println!("Browser version: {} (protocol {})", version.product, version.protocol_version);

    // Raw commands still work on the browser session
    let targets = browser
        .connection()
        .send(None, "Target.getTargets", json!({}))
        .await?;
    println!("Targets: {}", targets);

    // Subscribe to target events
    let mut events = browser.target_events();
    let watcher = tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                TargetEvent::Created(target) => println!("Target created: {:?}", target),
                TargetEvent::Changed(target) => println!("Target changed: {:?}", target),
                TargetEvent::Destroyed(target) => println!("Target destroyed: {:?}", target),
            }
        }
    });

    // Keep alive for a bit to see events
    tokio::time::sleep(Duration::from_secs(2)).await;

    // Clean shutdown
    browser.disconnect().await?;
    watcher.abort();
    println!("Disconnected");

    Ok(())
}
