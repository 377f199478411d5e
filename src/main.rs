//! Meshium - a point-to-multipoint mesh VPN data plane

use std::sync::Arc;

use ipnetwork::IpNetwork;
use tracing::{error, info, Level};
use tracing_subscriber::FmtSubscriber;

use meshium::config::Config;
use meshium::device::tun::NativeTun;
use meshium::device::Device;

fn main() {
    let args = Args::parse();

    if args.help {
        print_help();
        return;
    }

    // Initialize logging
    let log_level = std::env::var("RUST_LOG")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(Level::INFO);
    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber).expect("failed to set tracing subscriber");

    let config_path = match args.config.or_else(find_default_config) {
        Some(path) => path,
        None => {
            eprintln!("error: no configuration file found");
            eprintln!("pass -f <path>, or provide one of:");
            eprintln!("  - tests/server.toml");
            eprintln!("  - tests/client.toml");
            eprintln!("  - config.toml");
            std::process::exit(1);
        }
    };
    info!("using configuration file {}", config_path);

    let config = match Config::load(&config_path) {
        Ok(config) => config,
        Err(e) => {
            error!("failed to load configuration: {}", e);
            std::process::exit(1);
        }
    };

    let runtime = tokio::runtime::Runtime::new().expect("failed to start runtime");
    if let Err(e) = runtime.block_on(run(&config, &args.tun_name)) {
        error!("failed to start device: {}", e);
        std::process::exit(1);
    }
    info!("device stopped");
}

async fn run(config: &Config, tun_name: &str) -> meshium::Result<()> {
    let address: IpNetwork = config
        .interface
        .address
        .parse()
        .map_err(|e| meshium::Error::Config(format!("invalid Address: {}", e)))?;
    let IpNetwork::V4(address) = address else {
        return Err(meshium::Error::Config(
            "interface Address must be IPv4 in this version".into(),
        ));
    };

    let tun = Arc::new(NativeTun::create(tun_name, address)?);
    let device = Device::new(config, tun)?;
    device.start().await?;

    print_startup_info(config);

    tokio::signal::ctrl_c()
        .await
        .map_err(meshium::Error::from)?;
    info!("shutting down");
    device.close().await;
    Ok(())
}

fn find_default_config() -> Option<String> {
    ["tests/server.toml", "tests/client.toml", "config.toml"]
        .iter()
        .find(|path| std::path::Path::new(path).exists())
        .map(|path| path.to_string())
}

fn print_startup_info(config: &Config) {
    info!("=== meshium device up ===");
    info!("address: {}", config.interface.address);
    if config.interface.listen_port > 0 {
        info!("listening on port {}", config.interface.listen_port);
    } else {
        info!("client-only mode, no listener");
    }
    info!("peers: {}", config.peers.len());
    for (i, peer) in config.peers.iter().enumerate() {
        info!(
            "  peer {}: {} ({})",
            i + 1,
            peer.allowed_ips,
            peer.endpoint.as_deref().unwrap_or("passive")
        );
    }
    info!("press Ctrl+C to stop");
}

/// Command line arguments
struct Args {
    config: Option<String>,
    tun_name: String,
    help: bool,
}

impl Args {
    fn parse() -> Self {
        let args: Vec<String> = std::env::args().collect();
        let mut config = None;
        let mut tun_name = "tun0".to_string();
        let mut help = false;

        let mut i = 1;
        while i < args.len() {
            match args[i].as_str() {
                "-f" => {
                    if i + 1 < args.len() {
                        config = Some(args[i + 1].clone());
                        i += 1;
                    }
                }
                "-n" => {
                    if i + 1 < args.len() {
                        tun_name = args[i + 1].clone();
                        i += 1;
                    }
                }
                "-help" | "-h" | "--help" => help = true,
                _ => {}
            }
            i += 1;
        }

        Self {
            config,
            tun_name,
            help,
        }
    }
}

fn print_help() {
    println!(
        r#"meshium - mesh VPN data plane

USAGE:
    meshium [-f <config>] [-n <name>]

OPTIONS:
    -f <config>    Path to configuration file
    -n <name>      TUN interface name (default: tun0)
    -help          Print help information

Without -f, the configuration is searched in order:
    tests/server.toml, tests/client.toml, config.toml

EXAMPLES:
    meshium -f tests/server.toml
    meshium -f tests/client.toml -n tun1
"#
    );
}
