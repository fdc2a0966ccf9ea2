//! Download stored glucose records from a meter
//!
//! Run with: cargo run --example record_download

use bgm_rust_ble::{BleScanner, Error, Meter, Result};
use std::time::Duration;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt().with_env_filter("warn").init();

    println!("Glucose Record Download");
    println!("=======================\n");
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
    if let Some(name) = &discovered.local_name {
        println!("Name: {}", name);
    }
    println!("Connecting...\n");

    let meter = Meter::new(identifier, discovered.peripheral);

    // The platform stack runs the pairing dialogue during connect;
    // arming authorization here makes the readout fire as soon as
    // notifications are enabled.
    meter.authorize();

    let mut totals_rx = meter.subscribe_totals();
    let mut records_rx = meter.subscribe_records();

    meter.connect().await?;

    println!("Connected!\n");

    if let Ok(Ok(totals)) =
        tokio::time::timeout(Duration::from_secs(10), totals_rx.recv()).await
    {
        println!(
            "Meter reports {} stored records (max {}, last transfer {})\n",
            totals.total_amount, totals.max_amount, totals.last_transfer
        );
    }

    println!("Downloading most recent batch...\n");

    let mut downloaded = Vec::new();
    while downloaded.len() < 8 {
        match tokio::time::timeout(Duration::from_secs(30), records_rx.recv()).await {
            Ok(Ok(record)) => {
                println!("  {}", record);
                downloaded.push(record);
            }
            Ok(Err(_)) => break,
            Err(_) => {
                println!("Timed out waiting for records.");
                break;
            }
        }
    }

    println!("\nDownloaded {} records.", downloaded.len());

    meter.disconnect().await?;

    println!("\nDone!");

    Ok(())
}
