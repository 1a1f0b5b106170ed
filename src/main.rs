use std::path::PathBuf;
use std::sync::Arc;

use clap::{Args as ClapArgs, Parser, Subcommand};
use kube::api::{Api, ListParams};
use kube::ResourceExt;
use tracing::{error, info, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use tunnel_agent::{
    controller::{self, ControllerState},
    crd::Gateway,
    driver::DriverRegistry,
    telemetry, Config, Error,
};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the tunnel agent
    Run(RunArgs),
    /// Show version information
    Version,
    /// List gateways and the NAT info of their active endpoints
    Info(CommonArgs),
}

#[derive(ClapArgs, Debug)]
struct CommonArgs {
    /// Path to a TOML configuration file
    #[arg(long, short, env = "TUNNEL_AGENT_CONFIG")]
    config: Option<PathBuf>,

    /// Name of the node this agent runs on (defaults to the hostname)
    #[arg(long, env = "NODE_NAME")]
    node_name: Option<String>,
}

#[derive(ClapArgs, Debug)]
struct RunArgs {
    #[command(flatten)]
    common: CommonArgs,

    /// Emit logs as JSON
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,

    /// Route driver kind
    #[arg(long, env = "ROUTE_DRIVER")]
    route_driver: Option<String>,

    /// VPN driver kind
    #[arg(long, env = "VPN_DRIVER")]
    vpn_driver: Option<String>,

    /// Route each node's private IP through the tunnel
    #[arg(long, env = "FORWARD_NODE_IP")]
    forward_node_ip: bool,

    /// STUN server used for NAT probing, may be repeated
    #[arg(long = "stun-server", env = "STUN_SERVERS", value_delimiter = ',')]
    stun_servers: Vec<String>,

    /// Number of queue workers
    #[arg(long, env = "WORKERS")]
    workers: Option<usize>,

    /// Failed passes requeued before an item is dropped
    #[arg(long, env = "MAX_RETRIES")]
    max_retries: Option<u32>,

    /// Address of the health and metrics endpoint
    #[arg(long, env = "API_BIND_ADDRESS")]
    api_bind_address: Option<String>,
}

#[tokio::main]
async fn main() -> Result<(), Error> {
    let args = Args::parse();

    match args.command {
        Commands::Version => {
            println!("tunnel-agent v{}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
        Commands::Info(common) => run_info(common).await,
        Commands::Run(run_args) => run_agent(run_args).await,
    }
}

/// File settings first, then flags and environment, then the hostname
fn load_config(common: &CommonArgs) -> Result<Config, Error> {
    let mut config = match &common.config {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };
    if let Some(node_name) = &common.node_name {
        config.node_name = node_name.clone();
    }
    if config.node_name.is_empty() {
        config.node_name = hostname::get()
            .map_err(|e| Error::ConfigError(format!("Failed to read hostname: {}", e)))?
            .to_string_lossy()
            .into_owned();
    }
    Ok(config)
}

fn apply_overrides(config: &mut Config, args: &RunArgs) {
    if let Some(route_driver) = &args.route_driver {
        config.tunnel.route_driver = route_driver.clone();
    }
    if let Some(vpn_driver) = &args.vpn_driver {
        config.tunnel.vpn_driver = vpn_driver.clone();
    }
    if args.forward_node_ip {
        config.tunnel.forward_node_ip = true;
    }
    if !args.stun_servers.is_empty() {
        config.nat.stun_servers = args.stun_servers.clone();
    }
    if let Some(workers) = args.workers {
        config.engine.workers = workers;
    }
    if let Some(max_retries) = args.max_retries {
        config.engine.max_retries = max_retries;
    }
    if let Some(addr) = &args.api_bind_address {
        config.api.bind_address = addr.clone();
    }
}

async fn run_info(common: CommonArgs) -> Result<(), Error> {
    let config = load_config(&common)?;
    let client = kube::Client::try_default()
        .await
        .map_err(Error::KubeError)?;

    let api: Api<Gateway> = Api::all(client);
    let gateways = api
        .list(&ListParams::default())
        .await
        .map_err(Error::KubeError)?;

    println!("Node: {}", config.node_name);
    println!("Gateways: {}", gateways.items.len());
    for gw in &gateways.items {
        let marker = if gw.has_node(&config.node_name) { "*" } else { " " };
        match gw.tunnel_active_endpoint() {
            Some(ep) => println!(
                "{} {:<24} active={:<20} natType={:<22} publicPort={}",
                marker,
                gw.name_any(),
                ep.node_name,
                if ep.nat_type.is_empty() { "-" } else { ep.nat_type.as_str() },
                ep.public_port
            ),
            None => println!("{} {:<24} active=-", marker, gw.name_any()),
        }
    }
    Ok(())
}

fn init_tracing(log_json: bool, node_name: &str) -> Result<(), Error> {
    let env_filter = EnvFilter::builder()
        .with_default_directive(Level::INFO.into())
        .from_env_lossy();

    let (plain, json) = if log_json {
        (None, Some(fmt::layer().json().with_target(true)))
    } else {
        (Some(fmt::layer().with_target(true)), None)
    };

    let registry = tracing_subscriber::registry()
        .with(env_filter)
        .with(plain)
        .with(json);

    // Only enable OTEL if an endpoint is provided
    if telemetry::otel_enabled() {
        let otel_layer = telemetry::init_telemetry(node_name)?;
        registry.with(otel_layer).init();
        info!("OpenTelemetry tracing initialized");
    } else {
        registry.init();
        info!("OpenTelemetry tracing disabled (OTEL_EXPORTER_OTLP_ENDPOINT not set)");
    }
    Ok(())
}

async fn run_agent(args: RunArgs) -> Result<(), Error> {
    let mut config = load_config(&args.common)?;
    apply_overrides(&mut config, &args);
    config.validate()?;

    init_tracing(args.log_json, &config.node_name)?;

    info!(
        "Starting tunnel agent v{} on node {}",
        env!("CARGO_PKG_VERSION"),
        config.node_name
    );
    info!(
        "Route driver: {}, VPN driver: {}, STUN servers: {:?}",
        config.tunnel.route_driver, config.tunnel.vpn_driver, config.nat.stun_servers
    );

    let client = kube::Client::try_default()
        .await
        .map_err(Error::KubeError)?;
    info!("Connected to Kubernetes cluster");

    let state = Arc::new(ControllerState::new(
        client,
        Arc::new(config),
        DriverRegistry::with_builtin(),
    ));

    #[cfg(feature = "rest-api")]
    {
        let api_state = Arc::clone(&state);
        tokio::spawn(async move {
            if let Err(e) = tunnel_agent::rest_api::run_server(api_state).await {
                error!("REST API server error: {:?}", e);
            }
        });
    }

    let result = controller::run_controller(state).await;
    if let Err(e) = &result {
        error!("Controller exited with error: {}", e);
    }

    telemetry::shutdown_telemetry();
    result
}
