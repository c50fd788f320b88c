//! Network probe: find scan heads and print what they report.

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use triscan::discovery;

#[derive(Parser)]
#[command(name = "discover", about = "Probe the local network for scan heads")]
struct Args {
    /// Repeat the probe this many times, merging results.
    #[arg(long, default_value_t = 1)]
    rounds: u32,

    /// Only list heads compatible with this client.
    #[arg(long)]
    compatible_only: bool,

    /// Emit the device table as JSON instead of text.
    #[arg(long)]
    json: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();
    let args = Args::parse();

    let mut devices = std::collections::HashMap::new();
    for round in 0..args.rounds {
        if round > 0 {
            tokio::time::sleep(std::time::Duration::from_millis(250)).await;
        }
        devices.extend(discovery::discover().await?);
    }

    let mut devices: Vec<_> = devices.into_values().collect();
    devices.sort_by_key(|d| d.serial);
    if args.compatible_only {
        devices.retain(|d| d.is_compatible());
    }

    if args.json {
        println!("{}", serde_json::to_string_pretty(&devices)?);
        return Ok(());
    }

    println!(
        "{:<10} {:<8} {:<10} {:<16} {:<6} {:<10} compat",
        "serial", "product", "firmware", "address", "link", "state"
    );
    for device in &devices {
        println!(
            "{:<10} {:<8} {:<10} {:<16} {:<6} {:<10} {}",
            device.serial,
            format!("{:?}", device.product_type),
            device.firmware.to_string(),
            device.ip_server.to_string(),
            format!("{}M", device.link_speed_mbps),
            format!("{:?}", device.state),
            if device.is_compatible() { "yes" } else { "NO" },
        );
    }
    println!("\n{} scan head(s) found", devices.len());
    Ok(())
}
