//! Page lifecycle example - open a page, navigate, wait for network idle,
//! walk the frame tree and evaluate in the main world

use cdp::{Browser, BrowserConfig, NavigationOptions, WaitUntil, World};
use std::time::Duration;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let ws_url = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "ws://localhost:9222/devtools/browser".to_string());
    let url = std::env::args()
        .nth(2)
        .unwrap_or_else(|| "https://example.com".to_string());

    let config = BrowserConfig::new(ws_url).with_navigation_timeout(Duration::from_secs(20));
    let browser = Browser::connect(config).await?;

    let page = browser.new_page("about:blank").await?;
    println!("Opened page {}", page.target_id());

    let result = page
        .goto(
            &url,
            NavigationOptions::until([WaitUntil::Load, WaitUntil::NetworkIdle2]),
        )
        .await?;
    println!(
        "Navigated to {} (loader {:?}, status {:?})",
        result.url,
        result.loader_id,
        result.response.as_ref().map(|r| r.status)
    );

    for frame in page.frames() {
        let depth = std::iter::successors(frame.parent_frame(), |f| f.parent_frame()).count();
        println!(
            "{}{} {}",
            "  ".repeat(depth),
            frame.id().unwrap_or_default(),
            frame.url().unwrap_or_default()
        );
    }

    if let Some(main) = page.main_frame() {
        let context = main.execution_context(World::Main).await?;
        let title = context.evaluate("document.title").await?;
        println!("Title: {}", title);
    }

    page.close().await?;
    browser.disconnect().await?;
    Ok(())
}
