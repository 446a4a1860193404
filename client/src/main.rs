use anyhow::{Context, Result};
use bytes::Bytes;
use clap::{Args, Parser, Subcommand};
use std::io::Write;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;

mod blacklist;
mod carrier;
mod config;
mod fault;
mod pool;
mod proxy;
mod transport;

use blacklist::IpBlacklist;
use carrier::{CarrierSettings, HttpCarrier};
use config::{GTunnelConfig, RelayConfig};
use gtunnel_shared::TunnelOptions;
use pool::{RelayServer, StaticPool};
use transport::{TransportConfig, TunnelTransport};

#[derive(Parser)]
#[command(name = "gtunnel")]
#[command(author = "GTunnel Team")]
#[command(version)]
#[command(about = "Local HTTP proxy that tunnels requests through relay fetchers", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the local proxy
    Run(TunnelArgs),
    /// Fetch one URL through the tunnel and print the body
    Fetch {
        url: String,

        #[command(flatten)]
        tunnel: TunnelArgs,
    },
}

#[derive(Args, Debug, Default)]
struct TunnelArgs {
    /// Relay URL (repeatable)
    #[arg(short, long = "relay")]
    relays: Vec<String>,

    /// Shared secret sent to relays
    #[arg(short, long)]
    password: Option<String>,

    /// Local proxy address
    #[arg(short, long)]
    listen: Option<SocketAddr>,

    /// Attempts per request
    #[arg(long)]
    retries: Option<usize>,

    /// Delay after a saturated relay, in milliseconds
    #[arg(long)]
    retry_delay_ms: Option<u64>,

    /// Relay fetch deadline in seconds
    #[arg(long)]
    deadline_secs: Option<u64>,

    /// Largest response body a relay fetches
    #[arg(long)]
    maxsize: Option<usize>,

    /// Ask relays to verify origin certificates
    #[arg(long)]
    sslverify: bool,

    /// Configuration file (defaults to gtunnel.yml lookup)
    #[arg(short, long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_directive = if cli.verbose { "gtunnel=debug" } else { "gtunnel=info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directive)),
        )
        .init();

    match cli.command {
        Commands::Run(args) => {
            let config = load_config(&args)?;
            run_proxy(config).await?;
        }
        Commands::Fetch { url, tunnel } => {
            let config = load_config(&tunnel)?;
            fetch_once(config, &url).await?;
        }
    }

    Ok(())
}

/// File values first, then command-line overrides.
fn load_config(args: &TunnelArgs) -> Result<GTunnelConfig> {
    let path = args.config.clone().or_else(GTunnelConfig::find_config);
    let mut config = match path {
        Some(path) => {
            info!("Using config file {}", path.display());
            GTunnelConfig::load(&path)?
        }
        None => GTunnelConfig::default(),
    };
    apply_overrides(&mut config, args);
    config.validate()?;
    Ok(config)
}

fn apply_overrides(config: &mut GTunnelConfig, args: &TunnelArgs) {
    if !args.relays.is_empty() {
        config.relays = args
            .relays
            .iter()
            .map(|url| RelayConfig {
                url: url.clone(),
                password: None,
            })
            .collect();
    }
    if let Some(password) = &args.password {
        config.password = Some(password.clone());
    }
    if let Some(listen) = args.listen {
        config.listen = listen;
    }
    if let Some(retries) = args.retries {
        config.retries = retries;
    }
    if let Some(delay) = args.retry_delay_ms {
        config.retry_delay_ms = delay;
    }
    if let Some(deadline) = args.deadline_secs {
        config.deadline_secs = deadline;
    }
    if let Some(maxsize) = args.maxsize {
        config.maxsize = maxsize;
    }
    if args.sslverify {
        config.sslverify = true;
    }
}

fn build_transport(config: &GTunnelConfig) -> Result<TunnelTransport> {
    let blacklist = Arc::new(IpBlacklist::new());

    let settings = CarrierSettings {
        // the relay may spend the whole deadline fetching
        timeout: config.deadline() + Duration::from_secs(10),
        ..Default::default()
    };
    let carrier = HttpCarrier::new(settings, blacklist.clone()).context("Failed to build carrier client")?;

    let servers = config
        .relays
        .iter()
        .map(|relay| RelayServer::new(relay.url.clone(), config.password_for(relay)))
        .collect();
    let options = TunnelOptions {
        maxsize: config.maxsize,
        sslverify: config.sslverify,
        debug: config.debug,
        ..Default::default()
    };
    let pool = StaticPool::new(servers, options, config.bad_server_cooldown())?;

    let transport_config = TransportConfig {
        retries: config.retries,
        retry_delay: config.retry_delay(),
        deadline: config.deadline(),
    };
    Ok(TunnelTransport::new(Arc::new(carrier), Arc::new(pool), transport_config).with_blacklist(blacklist))
}

async fn run_proxy(config: GTunnelConfig) -> Result<()> {
    let transport = Arc::new(build_transport(&config)?);
    let settings = transport.config();

    println!("\n╔══════════════════════════════════════════════════════════════╗");
    println!("║  GTunnel Proxy Active                                        ║");
    println!("╠══════════════════════════════════════════════════════════════╣");
    println!("║  Listen:     http://{:<41} ║", config.listen);
    println!("║  Relays:     {:<47} ║", config.relays.len());
    println!("║  Retries:    {:<47} ║", settings.retries);
    println!("╚══════════════════════════════════════════════════════════════╝\n");

    tokio::select! {
        result = proxy::serve(config.listen, transport.clone()) => result?,
        _ = tokio::signal::ctrl_c() => info!("Shutting down..."),
    }

    Ok(())
}

async fn fetch_once(config: GTunnelConfig, url: &str) -> Result<()> {
    let transport = build_transport(&config)?;

    let uri: http::Uri = url.parse().with_context(|| format!("Invalid URL '{}'", url))?;
    let host = uri.authority().map(|a| a.to_string()).unwrap_or_default();
    let req = http::Request::builder()
        .method(http::Method::GET)
        .uri(uri)
        .header(http::header::HOST, host)
        .body(Bytes::new())?;

    let resp = transport.round_trip(req).await?;
    eprintln!("{:?} {}", resp.version(), resp.status());
    for (name, value) in resp.headers() {
        eprintln!("{}: {}", name, value.to_str().unwrap_or("<binary>"));
    }
    std::io::stdout().write_all(resp.body())?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flags_override_file() {
        let mut config = GTunnelConfig {
            relays: vec![RelayConfig {
                url: "https://file-relay.example/_gh/".into(),
                password: Some("from-file".into()),
            }],
            retries: 5,
            ..Default::default()
        };
        let args = TunnelArgs {
            relays: vec!["https://cli-relay.example/_gh/".into()],
            password: Some("from-cli".into()),
            retry_delay_ms: Some(50),
            ..Default::default()
        };

        apply_overrides(&mut config, &args);
        assert_eq!(config.relays.len(), 1);
        assert_eq!(config.relays[0].url, "https://cli-relay.example/_gh/");
        assert_eq!(config.password_for(&config.relays[0]).as_deref(), Some("from-cli"));
        assert_eq!(config.retries, 5);
        assert_eq!(config.retry_delay_ms, 50);
    }

    #[test]
    fn test_cli_parses_repeated_relays() {
        let cli = Cli::try_parse_from([
            "gtunnel",
            "run",
            "--relay",
            "https://a.example/_gh/",
            "--relay",
            "https://b.example/_gh/",
            "--retries",
            "4",
        ])
        .unwrap();
        match cli.command {
            Commands::Run(args) => {
                assert_eq!(args.relays.len(), 2);
                assert_eq!(args.retries, Some(4));
            }
            Commands::Fetch { .. } => panic!("expected run"),
        }
    }
}
