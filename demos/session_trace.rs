//! Watch the session state machine while talking to a meter
//!
//! Run with: cargo run --example session_trace

use bgm_rust_ble::{BleScanner, Error, Meter, Result, SessionState};
use std::time::Duration;

#[tokio::main]
async fn main() -> Result<()> {
    // Verbose logging so the discovery/subscription script is visible
    tracing_subscriber::fmt().with_env_filter("debug").init();

    println!("Session Trace");
    println!("=============\n");
    println!("Looking for meters...\n");

    let scanner = BleScanner::new().await?;
    scanner.start_scanning().await?;

    tokio::time::sleep(Duration::from_secs(5)).await;

    scanner.stop_scanning().await?;

    let (identifier, discovered) = scanner
        .discovered_meters()
        .into_iter()
        .next()
        .ok_or(Error::NotConnected)?;

    println!("Found meter: {}", identifier);

    let meter = Meter::new(identifier, discovered.peripheral);
    meter.authorize();

    let _callback = meter.on_record(|record| {
        println!("record: {}", record);
    });

    meter.connect().await?;

    // Poll the session state until records stream or we give up
    let start = std::time::Instant::now();
    let mut last_state = SessionState::Idle;

    while start.elapsed() < Duration::from_secs(60) {
        let state = meter.session_state();
        if state != last_state {
            println!("[{:6.1}s] session: {}", start.elapsed().as_secs_f64(), state);
            last_state = state;
        }

        if state == SessionState::Streaming && start.elapsed() > Duration::from_secs(15) {
            break;
        }

        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    meter.disconnect().await?;
    println!("\nFinal session state: {}", meter.session_state());

    Ok(())
}
