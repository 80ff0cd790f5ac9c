use std::net::IpAddr;
use std::time::Duration;

use ardrone::{ARDrone, ConnectionState, DEFAULT_DRONE_ADDRESS, DroneConfig};
use clap::Parser;
use tracing_subscriber::EnvFilter;

/// Connect to an AR.Drone and print its navigation data
#[derive(Parser, Debug)]
#[command(version, about)]
struct Args {
    /// Address of the drone
    #[arg(short, long, default_value_t = IpAddr::V4(DEFAULT_DRONE_ADDRESS))]
    address: IpAddr,

    /// Flat trim after connecting, the drone must be on flat ground
    #[arg(long)]
    trim: bool,

    /// Request the full navdata set instead of the demo one
    #[arg(long)]
    full: bool,

    /// Number of seconds to print navdata for
    #[arg(short, long, default_value_t = 10)]
    duration: u64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();

    let drone = ARDrone::with_config(DroneConfig::default().with_address(args.address));
    drone.connect().await?;

    if args.full {
        drone.send_all_navigation_data()?;
    } else {
        drone.send_demo_navigation_data()?;
    }
    if args.trim {
        drone.trim()?;
    }
    drone.mark_ready()?;

    println!("Printing navdata from {} for {}s", args.address, args.duration);
    let deadline = tokio::time::Instant::now() + Duration::from_secs(args.duration);
    let mut state_check = tokio::time::interval(Duration::from_secs(1));
    loop {
        tokio::select! {
            navdata = drone.navdata().pop() => println!("{}", navdata),
            _ = state_check.tick() => {}
            _ = tokio::time::sleep_until(deadline) => break,
            _ = tokio::signal::ctrl_c() => break,
        }

        // A reset of the drone puts the link back in bootstrap, wait for it to be ready again
        if drone.state() == ConnectionState::Bootstrap {
            println!("Drone restarted, requesting navdata again");
            if args.full {
                drone.send_all_navigation_data()?;
            } else {
                drone.send_demo_navigation_data()?;
            }
            drone.mark_ready()?;
        }
    }

    drone.disconnect().await;
    Ok(())
}
