use anyhow::{Result, bail};
use clap::{Parser, Subcommand, ValueEnum};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

use wifi_onboard::{
    browse::{SystemBrowser, login_url},
    config::{self, Config, NetworkConfig},
    connectivity::{ConnectivityHost, NmConnectivityHost, Transport},
    flow::{FlowHosts, FlowState, HandoffController},
    gateway::{GatewayResolver, LeaseTableResolver},
    interface,
    join::{HostTier, JoinStrategy, NmSpecifierHost, NmSuggestionHost, TargetNetwork},
    permission::{NmPermissionHost, PermissionGate},
    store::{FileStore, OnboardingStateStore},
};

#[derive(Parser)]
#[command(name = "wifi-onboard")]
#[command(about = "Onboard this device onto a WiFi access point and open its captive portal")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum StrategyArg {
    /// Pick by host capability tier
    Auto,
    /// Declarative autoconnect hint
    Suggestion,
    /// Imperative join with explicit bind
    Specifier,
}

#[derive(Subcommand)]
enum Commands {
    /// List available WiFi interfaces
    ListInterfaces,

    /// Join the target network and hand off to its captive portal login page
    Onboard {
        /// SSID of the network to onboard onto (defaults to the first saved network)
        ssid: Option<String>,

        /// Passphrase for the network (uses saved passphrase if not provided)
        #[arg(short, long)]
        passphrase: Option<String>,

        /// Interface to use (defaults to auto-detected WiFi interface)
        #[arg(short, long)]
        interface: Option<String>,

        /// Join strategy
        #[arg(short, long, value_enum, default_value = "auto")]
        strategy: StrategyArg,

        /// Seconds to wait on the specifier path before trusting the join
        #[arg(long)]
        settle_delay: Option<u64>,

        /// Save credentials to config file
        #[arg(long)]
        save: bool,
    },

    /// Show the active network classification, gateway and login URL
    Status {
        /// Interface to check (defaults to auto-detected WiFi interface)
        #[arg(short, long)]
        interface: Option<String>,
    },

    /// Forget that onboarding completed so the next run repeats the flow
    Reset,

    /// Save network credentials to config file
    SaveNetwork {
        /// SSID of the network
        ssid: String,

        /// Passphrase for the network
        #[arg(short, long)]
        passphrase: String,

        /// Preferred interface for this network
        #[arg(short, long)]
        interface: Option<String>,
    },

    /// Show saved configuration
    ShowConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .compact()
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::ListInterfaces => cmd_list_interfaces(),
        Commands::Onboard {
            ssid,
            passphrase,
            interface,
            strategy,
            settle_delay,
            save,
        } => {
            cmd_onboard(
                ssid,
                passphrase,
                interface.as_deref(),
                strategy,
                settle_delay,
                save,
            )
            .await
        }
        Commands::Status { interface } => cmd_status(interface.as_deref()).await,
        Commands::Reset => cmd_reset(),
        Commands::SaveNetwork {
            ssid,
            passphrase,
            interface,
        } => cmd_save_network(&ssid, &passphrase, interface.as_deref()),
        Commands::ShowConfig => cmd_show_config(),
    }
}

fn cmd_list_interfaces() -> Result<()> {
    let interfaces = interface::list_wifi_interfaces()?;

    if interfaces.is_empty() {
        println!("No WiFi interfaces found.");
        return Ok(());
    }

    println!("{:<16} {}", "INTERFACE", "STATE");
    println!("{}", "-".repeat(28));

    for iface in interfaces {
        println!("{:<16} {}", iface.name, iface.state);
    }

    Ok(())
}

async fn cmd_onboard(
    ssid: Option<String>,
    passphrase: Option<String>,
    interface: Option<&str>,
    strategy: StrategyArg,
    settle_delay: Option<u64>,
    save: bool,
) -> Result<()> {
    let mut cfg = Config::load().unwrap_or_default();

    // Resolve target credentials from arguments or config
    let (ssid, passphrase) = match ssid {
        Some(ssid) => {
            let passphrase = match passphrase {
                Some(p) => p,
                None => {
                    if let Some(network) = cfg.find_network(&ssid) {
                        println!("Using saved passphrase for '{}'", ssid);
                        network.passphrase.clone()
                    } else {
                        bail!("No passphrase provided and no saved credentials for '{}'", ssid);
                    }
                }
            };
            (ssid, passphrase)
        }
        None => {
            let Some(network) = cfg.networks.first() else {
                bail!("No SSID provided and no saved networks in config");
            };
            (network.ssid.clone(), network.passphrase.clone())
        }
    };

    let target = TargetNetwork::new(ssid.clone(), passphrase.clone())?;

    let iface =
        interface::resolve_interface(interface.or(cfg.default_interface.as_deref()))?;

    let tier = match strategy {
        StrategyArg::Auto => HostTier::detect(),
        StrategyArg::Suggestion => HostTier::Suggestion,
        StrategyArg::Specifier => HostTier::Specifier,
    };
    let join_strategy = match tier {
        HostTier::Suggestion => {
            JoinStrategy::suggestion(Arc::new(NmSuggestionHost::new(Some(iface.name.clone()))))
        }
        HostTier::Specifier => {
            JoinStrategy::specifier(Arc::new(NmSpecifierHost::new(iface.name.clone())))
        }
    };

    let settle = settle_delay
        .map(Duration::from_secs)
        .unwrap_or_else(|| cfg.settle_delay());

    let hosts = FlowHosts {
        gate: PermissionGate::new(Arc::new(NmPermissionHost)),
        strategy: join_strategy,
        connectivity: Arc::new(NmConnectivityHost::new(
            Some(iface.name.clone()),
            cfg.probe_url.clone(),
        )),
        resolver: Arc::new(LeaseTableResolver::new(Some(iface.name.clone()))),
        store: Arc::new(FileStore::new(FileStore::default_path()?)),
        browser: Arc::new(SystemBrowser),
    };

    let controller = Arc::new(HandoffController::new(target, hosts, settle));

    // Ctrl-C tears the flow down instead of leaving registrations behind
    {
        let controller = controller.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                controller.cancel();
            }
        });
    }

    println!(
        "Onboarding onto '{}' via interface {} ({} strategy)...",
        ssid,
        iface.name,
        match tier {
            HostTier::Suggestion => "suggestion",
            HostTier::Specifier => "specifier",
        }
    );

    let report = controller.start().await?;

    match &report.state {
        FlowState::Done => match &report.handoff_url {
            Some(url) => {
                match report.has_internet {
                    Some(true) => println!("Connected to '{}' with internet", ssid),
                    Some(false) => println!("Connected to '{}' (local only)", ssid),
                    None => {}
                }
                println!("Opened {}", url);
                if !report.store_persisted {
                    println!("Warning: completion record was not persisted; the flow will run again next time");
                }
            }
            None => println!("Onboarding already completed; nothing to do"),
        },
        state => {
            println!("{}", state);
            std::process::exit(1);
        }
    }

    // Save credentials if requested
    if save {
        cfg.add_network(NetworkConfig {
            ssid,
            passphrase,
            interface: Some(iface.name),
        });
        cfg.save()?;
        println!("Credentials saved to config.");
    }

    Ok(())
}

async fn cmd_status(interface: Option<&str>) -> Result<()> {
    let cfg = Config::load().unwrap_or_default();
    let iface = interface::resolve_interface(interface.or(cfg.default_interface.as_deref()))?;

    println!("Interface: {}", iface.name);
    println!("State:     {}", iface.state);

    let host = NmConnectivityHost::new(Some(iface.name.clone()), cfg.probe_url.clone());
    let resolver = LeaseTableResolver::new(Some(iface.name.clone()));

    match host.active_network().await {
        Some(active) => {
            println!(
                "Transport: {}",
                match active.transport {
                    Transport::Wifi => "wifi",
                    Transport::Other => "other",
                }
            );
            println!("Internet:  {}", if active.has_internet { "yes" } else { "no" });

            match resolver.resolve() {
                Some(gateway) => {
                    println!("Gateway:   {}", gateway);
                    println!("Login URL: {}", login_url(gateway));
                }
                None => println!("Gateway:   (none)"),
            }
        }
        None => println!("Transport: (no active network)"),
    }

    let store = FileStore::new(FileStore::default_path()?);
    println!("Onboarded: {}", if store.has_completed_once() { "yes" } else { "no" });

    Ok(())
}

fn cmd_reset() -> Result<()> {
    let store = FileStore::new(FileStore::default_path()?);
    store.clear()?;
    println!("Onboarding state cleared.");

    Ok(())
}

fn cmd_save_network(ssid: &str, passphrase: &str, interface: Option<&str>) -> Result<()> {
    let mut cfg = Config::load().unwrap_or_default();

    cfg.add_network(NetworkConfig {
        ssid: ssid.to_string(),
        passphrase: passphrase.to_string(),
        interface: interface.map(String::from),
    });

    cfg.save()?;

    let path = config::config_path()?;
    println!("Saved network '{}' to {}", ssid, path.display());

    Ok(())
}

fn cmd_show_config() -> Result<()> {
    let path = config::config_path()?;
    println!("Config file: {}", path.display());
    println!();

    let cfg = Config::load()?;

    if cfg.networks.is_empty() {
        println!("No saved networks.");
    } else {
        println!("{:<24} {:<20} {}", "SSID", "INTERFACE", "PASSPHRASE");
        println!("{}", "-".repeat(60));
        for network in &cfg.networks {
            let iface = network.interface.as_deref().unwrap_or("-");
            let masked = "*".repeat(network.passphrase.len().min(12));
            println!("{:<24} {:<20} {}", network.ssid, iface, masked);
        }
    }

    println!();
    println!("Settle delay: {}s", cfg.settle_delay_secs);

    Ok(())
}
