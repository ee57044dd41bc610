// Repeater tool for Linux: bind a device, ping through the data channel, or run a responder.

mod config;

use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use repeater_core::crypto::AesKey;
use repeater_core::identity::{decode_hex, MacAddr};
use repeater_core::server::{DeviceRegistry, RepeaterServer};
use repeater_core::RepeaterClient;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "repeater-linux", version, about = "Repeater binding and data channel tool")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(clap::Args)]
struct Binding {
    /// Repeater host (falls back to config `server`).
    #[arg(long)]
    server: Option<String>,
    /// Device MAC, e.g. AA:BB:CC:DD:EE:FF.
    #[arg(long)]
    mac: MacAddr,
    /// Master secret as hex (1..=16 bytes).
    #[arg(long)]
    master: String,
    /// AES key text, 16 or 32 characters.
    #[arg(long)]
    key: String,
}

#[derive(Subcommand)]
enum Command {
    /// Run the hello handshake and print the bound key and IV.
    Bind(Binding),
    /// Bind, connect, send one message and print the reply.
    Ping {
        #[command(flatten)]
        binding: Binding,
        /// Data port (defaults to the bind port).
        #[arg(long)]
        port: Option<u16>,
        #[arg(long, default_value = "ping")]
        message: String,
    },
    /// Run a responder that binds provisioned devices and echoes their data.
    Serve {
        /// Listen address (falls back to config `listen`).
        #[arg(long)]
        listen: Option<String>,
        /// Provisioned device as MAC=KEY; repeatable.
        #[arg(long = "device", required = true)]
        devices: Vec<String>,
    },
    /// Print a fresh readable AES-128 key.
    Keygen,
}

fn main() -> Result<()> {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "repeater_core=info,repeater_linux=info".into()),
        )
        .with_writer(std::io::stderr)
        .try_init();

    let cli = Cli::parse();
    let cfg = config::load();
    match cli.command {
        Command::Bind(b) => bind(&cfg, &b),
        Command::Ping {
            binding,
            port,
            message,
        } => ping(&cfg, &binding, port, &message),
        Command::Serve { listen, devices } => {
            serve(listen.unwrap_or_else(|| cfg.listen.clone()), &devices)
        }
        Command::Keygen => {
            let key = AesKey::generate_readable();
            println!("{}", String::from_utf8_lossy(key.as_bytes()));
            Ok(())
        }
    }
}

fn server_of(cfg: &config::Config, b: &Binding) -> Result<String> {
    b.server
        .clone()
        .or_else(|| cfg.server.clone())
        .context("no --server given and no `server` in config")
}

fn bind_with(client: &RepeaterClient, server: &str, b: &Binding) -> Result<()> {
    let master = decode_hex(&b.master).context("--master must be hex")?;
    client
        .bind_device(server, b.mac.as_bytes(), &master, b.key.as_bytes())
        .with_context(|| format!("bind via {}", server))
}

fn bind(cfg: &config::Config, b: &Binding) -> Result<()> {
    let server = server_of(cfg, b)?;
    let client = RepeaterClient::with_config(&server, u32::from(cfg.client.bind_port), cfg.client.clone())?;
    bind_with(&client, &server, b)?;
    let key = client.aes_key().context("no key after bind")?;
    let iv = client.aes_iv().context("no iv after bind")?;
    println!("key: {}", String::from_utf8_lossy(&key));
    println!("iv:  {}", String::from_utf8_lossy(&iv));
    client.release();
    Ok(())
}

fn ping(cfg: &config::Config, b: &Binding, port: Option<u16>, message: &str) -> Result<()> {
    if message.is_empty() {
        bail!("--message must not be empty");
    }
    let server = server_of(cfg, b)?;
    let port = port.unwrap_or(cfg.client.bind_port);
    let client = RepeaterClient::with_config(&server, u32::from(port), cfg.client.clone())?;
    let result = (|| -> Result<()> {
        bind_with(&client, &server, b)?;
        client.connect().context("connect")?;
        let sent = client.send(message.as_bytes()).context("send")?;
        let reply = client.receive(cfg.client.max_payload).context("receive")?;
        println!("sent {} bytes, reply: {}", sent, String::from_utf8_lossy(&reply));
        Ok(())
    })();
    client.release();
    result
}

fn parse_device(arg: &str) -> Result<(MacAddr, AesKey)> {
    let (mac, key) = arg
        .split_once('=')
        .with_context(|| format!("device `{}` is not MAC=KEY", arg))?;
    let mac: MacAddr = mac.parse().with_context(|| format!("bad MAC in `{}`", arg))?;
    let key = AesKey::from_slice(key.as_bytes())
        .with_context(|| format!("key for {} must be 16 or 32 characters", mac))?;
    Ok((mac, key))
}

fn serve(listen: String, devices: &[String]) -> Result<()> {
    let registry = Arc::new(DeviceRegistry::new());
    for d in devices {
        let (mac, key) = parse_device(d)?;
        registry.provision(mac, key);
    }
    let rt = repeater_core::runtime::runtime().context("start runtime")?;
    rt.block_on(async {
        let server = RepeaterServer::bind(listen.as_str(), registry)
            .await
            .with_context(|| format!("listen on {}", listen))?;
        tracing::info!(addr = %server.local_addr()?, devices = devices.len(), "serving");
        tokio::select! {
            r = server.serve() => r.context("accept loop"),
            r = shutdown_signal() => r,
        }
    })
}

/// Wait for Ctrl+C or SIGTERM (Unix).
async fn shutdown_signal() -> Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
    }
    tracing::info!("shutting down");
    Ok(())
}
