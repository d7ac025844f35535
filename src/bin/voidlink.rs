use std::fs;
use std::io::{self, Write};
use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio::sync::broadcast;
use tracing::{info, warn};

use void_link::config::load_config;
use void_link::control::{AgentClient, TransportClient};
use void_link::forward::{ForwardEvent, PortForwardService, TcpDialer};
use void_link_protocol::CONTENT_TYPE_JSON;

#[derive(Parser, Debug)]
#[command(name = "voidlink", version, about = "Host-side network bridge and control client for void guests")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Send one raw request over the control socket.
    Request {
        /// Control socket path.
        #[arg(short = 's', long = "socket", env = "VOIDLINK_SOCKET")]
        socket: PathBuf,
        /// HTTP method.
        #[arg(short = 'X', long = "method", default_value = "GET")]
        method: String,
        /// Request path, e.g. /health.
        path: String,
        /// JSON request body.
        #[arg(short = 'd', long = "data")]
        data: Option<String>,
        /// Write the response body to this file instead of stdout.
        #[arg(short = 'o', long = "output")]
        output: Option<PathBuf>,
    },
    /// Query the guest agent's health endpoint.
    Health {
        #[arg(short = 's', long = "socket", env = "VOIDLINK_SOCKET")]
        socket: PathBuf,
    },
    /// Validate a config file and print its forwarding table.
    Check {
        #[arg(short = 'c', long = "config")]
        config: PathBuf,
    },
    /// Run port forwarding to a guest reachable over a host-visible address.
    Forward {
        #[arg(short = 'c', long = "config")]
        config: PathBuf,
        /// Guest address; defaults to the config's guest_ip.
        #[arg(long = "guest-ip")]
        guest_ip: Option<IpAddr>,
    },
    /// Print the version.
    Version,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    match Cli::parse().command {
        Commands::Request {
            socket,
            method,
            path,
            data,
            output,
        } => cmd_request(socket, method, path, data, output).await?,
        Commands::Health { socket } => cmd_health(socket).await?,
        Commands::Check { config } => cmd_check(config)?,
        Commands::Forward { config, guest_ip } => cmd_forward(config, guest_ip).await?,
        Commands::Version => println!("voidlink {}", env!("CARGO_PKG_VERSION")),
    }

    Ok(())
}

async fn cmd_request(
    socket: PathBuf,
    method: String,
    path: String,
    data: Option<String>,
    output: Option<PathBuf>,
) -> Result<(), Box<dyn std::error::Error>> {
    if let Some(data) = &data {
        // Catch typos before they reach the guest.
        serde_json::from_str::<serde_json::Value>(data)?;
    }

    let client = TransportClient::new(socket);
    let response = tokio::task::spawn_blocking(move || {
        client.request(
            &method.to_uppercase(),
            &path,
            data.as_deref().map(str::as_bytes),
            data.as_ref().map(|_| CONTENT_TYPE_JSON),
        )
    })
    .await??;

    eprintln!("HTTP {} {}", response.status, response.reason);
    let body = response.body.clone().unwrap_or_default();
    match output {
        Some(path) => {
            fs::write(&path, &body)?;
            eprintln!("wrote {} bytes to {}", body.len(), path.display());
        }
        None => {
            let mut stdout = io::stdout().lock();
            stdout.write_all(&body)?;
            if !body.ends_with(b"\n") && !body.is_empty() {
                stdout.write_all(b"\n")?;
            }
        }
    }

    if let Some(message) = response.error_message() {
        return Err(message.into());
    }
    Ok(())
}

async fn cmd_health(socket: PathBuf) -> Result<(), Box<dyn std::error::Error>> {
    let agent = AgentClient::new(TransportClient::new(socket));
    let health = tokio::task::spawn_blocking(move || agent.health()).await??;

    println!("status: {}", health.status);
    if let Some(version) = &health.version {
        println!("version: {}", version);
    }
    if let Some(uptime) = health.uptime_secs {
        println!("uptime: {}s", uptime);
    }
    if !health.is_ok() {
        return Err(format!("guest agent is unhealthy: {}", health.status).into());
    }
    Ok(())
}

fn cmd_check(path: PathBuf) -> Result<(), Box<dyn std::error::Error>> {
    let config = load_config(&path)?;
    let network = &config.network;

    println!("config: {} (valid)", path.display());
    println!(
        "gateway: {}/{} ({})",
        network.gateway_ip, network.prefix_len, network.gateway_mac
    );
    match network.guest_mac {
        Some(mac) => println!("guest: {} ({})", network.guest_ip, mac),
        None => println!("guest: {} (MAC learned via ARP)", network.guest_ip),
    }
    println!("bind: {}", config.bind_address);
    if let Some(socket) = &config.control_socket {
        println!("control: {}", socket.display());
    }

    if config.forwards.is_empty() {
        println!("forwards: none");
    } else {
        println!("forwards:");
        for forward in &config.forwards {
            println!("  {}", forward);
        }
    }
    Ok(())
}

async fn cmd_forward(
    path: PathBuf,
    guest_ip: Option<IpAddr>,
) -> Result<(), Box<dyn std::error::Error>> {
    let config = load_config(&path)?;
    let guest_ip = guest_ip.unwrap_or(IpAddr::V4(config.network.guest_ip));

    let service = PortForwardService::new(Arc::new(TcpDialer::new(guest_ip)), config.bind_address);
    let mut events = service.subscribe();
    tokio::spawn(async move {
        loop {
            let event = match events.recv().await {
                Ok(event) => event,
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    warn!("missed {} forward event(s)", missed);
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => break,
            };
            match event {
                ForwardEvent::Listening { host_port, addr } => {
                    info!("forward {} listening on {}", host_port, addr)
                }
                ForwardEvent::BindFailed { host_port, error } => {
                    warn!("forward {} failed: {}", host_port, error)
                }
                other => info!("forward event: {:?}", other),
            }
        }
    });

    let failures = service.start(&config.forwards).await;
    if !failures.is_empty() && service.listening_ports().await.is_empty() {
        return Err(format!("no port forward could be started ({} failed)", failures.len()).into());
    }

    info!("forwarding to {}; press Ctrl-C to stop", guest_ip);
    tokio::signal::ctrl_c().await?;

    service.shutdown().await;
    Ok(())
}
