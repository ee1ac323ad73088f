use anyhow::{Context, Result};
use clap::Parser;
use gridlink::clients;
use gridlink::runtime::Runtime;
use gridlink::{init_logging, ClientHub, Config, Controller, DeviceIdentity, BUILD_DATE, VERSION};
use gridlink_communication::list_ports;
use gridlink_core::DeviceMode;
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "gridlink")]
#[command(about = "Stream G-code to Marlin and GRBL firmware over serial or TCP")]
#[command(version)]
struct Cli {
    /// Configuration file (TOML or JSON)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Device path, or host:port for a networked device
    #[arg(short, long)]
    port: Option<String>,

    /// Serial baud rate
    #[arg(short, long)]
    baud: Option<u32>,

    /// Machine family: fdm or cnc
    #[arg(short, long, value_parser = parse_mode)]
    mode: Option<DeviceMode>,

    /// Control port for raw TCP clients
    #[arg(short, long)]
    listen: Option<u16>,

    /// Accept commands on stdin
    #[arg(long)]
    stdin: bool,

    /// Checksum every transmitted command
    #[arg(long)]
    checksum: bool,

    /// Verbose wire echo to clients
    #[arg(short, long)]
    debug: bool,

    /// List candidate serial ports and exit
    #[arg(long)]
    probe: bool,

    /// Log verbosity (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn parse_mode(s: &str) -> std::result::Result<DeviceMode, String> {
    DeviceMode::parse(s).ok_or_else(|| format!("unknown mode '{}', expected fdm or cnc", s))
}

impl Cli {
    /// Command line flags win over the configuration file.
    fn apply(&self, config: &mut Config) {
        if let Some(port) = &self.port {
            config.port = Some(port.clone());
        }
        if let Some(baud) = self.baud {
            config.baud = baud;
        }
        if let Some(mode) = self.mode {
            config.mode = mode;
        }
        if let Some(listen) = self.listen {
            config.listen = Some(listen);
        }
        config.stdin |= self.stdin;
        config.checksum |= self.checksum;
        config.debug |= self.debug;
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose)?;

    if cli.probe {
        for port in list_ports()? {
            println!(
                "{} manufacturer={} vid={} pid={}",
                port.port_name,
                port.manufacturer.as_deref().unwrap_or("-"),
                port.vid.map(|v| format!("{:04x}", v)).unwrap_or_else(|| "-".into()),
                port.pid.map(|p| format!("{:04x}", p)).unwrap_or_else(|| "-".into()),
            );
        }
        return Ok(());
    }

    let config_path = cli
        .config
        .clone()
        .or_else(|| Config::default_path().filter(|p| p.exists()));
    let mut config = Config::load(config_path.as_deref()).with_context(|| match &config_path {
        Some(p) => format!("loading {}", p.display()),
        None => "loading configuration".to_string(),
    })?;
    cli.apply(&mut config);
    config.validate()?;
    if config.port.is_none() {
        match list_ports() {
            Ok(ports) => match ports.into_iter().next() {
                Some(found) => {
                    tracing::info!("using detected port {}", found.port_name);
                    config.port = Some(found.port_name);
                }
                None => tracing::warn!("no port configured and none detected"),
            },
            Err(e) => tracing::warn!("port detection failed: {}", e),
        }
    }

    tracing::info!("gridlink {} ({})", VERSION, BUILD_DATE);

    let identity = DeviceIdentity {
        name: clients::display_name(&config),
        uuid: clients::load_or_create_uuid(&config.uuid_file)
            .with_context(|| format!("controller id {}", config.uuid_file.display()))?,
        version: VERSION.to_string(),
    };
    tracing::info!("controller {} ({})", identity.name, identity.uuid);

    let hub = Arc::new(ClientHub::new());
    let listen = config.listen;
    let stdin = config.stdin;
    let mut controller = Controller::new(config, identity, hub.clone());
    controller.set_addresses(clients::local_addresses());

    let runtime = Runtime::new(controller, hub.clone(), stdin);
    clients::spawn_console(hub.clone(), runtime.events(), stdin);
    if let Some(port) = listen {
        clients::bind_control_port(port, hub.clone(), runtime.events())
            .await
            .with_context(|| format!("binding control port {}", port))?;
    }

    let code = runtime.run().await?;
    if code != 0 {
        std::process::exit(code);
    }
    Ok(())
}
