use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand};
use log::{error, info, warn};

use groundstation::config::Config;

#[derive(Parser)]
#[command(name = "groundstation")]
#[command(about = "Command and monitor a rover over an AT-command LoRa modem")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file path (can be used before or after subcommand)
    #[arg(short, long, default_value = "groundstation.toml", global = true)]
    config: String,

    /// Verbose logging (-v, -vv for more; may appear before or after subcommand)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a default configuration file
    Init,
    /// List serial devices
    Ports,
    /// Probe the modem and print its identity and settings as JSON
    Probe {
        /// Modem serial port (overrides the config file)
        #[arg(short, long)]
        port: Option<String>,
    },
    /// Push the [radio] settings from the config file to the modem
    Configure {
        #[arg(short, long)]
        port: Option<String>,
    },
    /// Open a session and accept operator commands on stdin
    Start {
        #[arg(short, long)]
        port: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = match cli.command {
        Commands::Init | Commands::Ports => None,
        _ => Some(Config::load(&cli.config).await?),
    };

    // -v wins over the configured level
    let log_level = match cli.verbose {
        0 => config.as_ref().map_or("info", |c| c.logging.level.as_str()).to_string(),
        1 => "debug".to_string(),
        _ => "trace".to_string(),
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(log_level)).init();

    info!("Ground station v{}", env!("CARGO_PKG_VERSION"));

    match cli.command {
        Commands::Init => {
            info!("Initializing new ground station configuration");
            Config::create_default(&cli.config).await?;
            info!("Configuration file created at {}", cli.config);
        }
        Commands::Ports => console::list_ports()?,
        Commands::Probe { port } => console::probe(&with_port(config, port)?).await?,
        Commands::Configure { port } => console::configure(&with_port(config, port)?).await?,
        Commands::Start { port } => console::start(&with_port(config, port)?).await?,
    }

    Ok(())
}

fn with_port(config: Option<Config>, port: Option<String>) -> Result<Config> {
    let mut config = config.ok_or_else(|| anyhow!("configuration not loaded"))?;
    if let Some(port) = port {
        info!("Using serial port {} from the command line", port);
        config.serial.port = port;
    }
    Ok(config)
}

#[cfg(not(feature = "serial"))]
mod console {
    use super::*;

    fn unsupported() -> ! {
        error!("Serial commands require the 'serial' feature");
        std::process::exit(2);
    }

    pub fn list_ports() -> Result<()> {
        unsupported()
    }

    pub async fn probe(_config: &Config) -> Result<()> {
        unsupported()
    }

    pub async fn configure(_config: &Config) -> Result<()> {
        unsupported()
    }

    pub async fn start(_config: &Config) -> Result<()> {
        unsupported()
    }
}

#[cfg(feature = "serial")]
mod console {
    use super::*;
    use std::path::Path;

    use groundstation::link::{Command, SessionChannels, SessionEvent, SessionHandle};
    use groundstation::metrics;
    use groundstation::radio::modem::ModemConfigurator;
    use groundstation::radio::record::{FrameRecord, FrameTap};
    use groundstation::radio::{available_ports, RadioChannel};
    use groundstation::telemetry::TelemetrySample;
    use tokio::fs::{self, OpenOptions};
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
    use tokio::sync::mpsc;
    use tokio::time::Duration;

    const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

    pub fn list_ports() -> Result<()> {
        let ports = available_ports()?;
        if ports.is_empty() {
            println!("No serial ports found");
        }
        for port in ports {
            println!("{}", port);
        }
        Ok(())
    }

    pub async fn probe(config: &Config) -> Result<()> {
        let mut channel = RadioChannel::open(&config.serial, FrameTap::disabled(), config.session.poll_interval())?;
        let result = ModemConfigurator::new(&mut channel, config.session.exchange_timeout()).query_info().await;
        channel.close().await;
        let payload = match result {
            Ok(info) => {
                let replies: serde_json::Map<String, serde_json::Value> = info
                    .into_iter()
                    .map(|(query, reply)| (query, reply.map_or(serde_json::Value::Null, serde_json::Value::String)))
                    .collect();
                serde_json::json!({ "status": "ok", "port": config.serial.port, "replies": replies })
            }
            Err(e) => serde_json::json!({ "status": "error", "port": config.serial.port, "error": e.to_string() }),
        };
        let ok = payload["status"] == "ok";
        println!("{}", payload);
        if !ok {
            std::process::exit(1);
        }
        Ok(())
    }

    pub async fn configure(config: &Config) -> Result<()> {
        let mut channel = RadioChannel::open(&config.serial, FrameTap::disabled(), config.session.poll_interval())?;
        let result = {
            let mut modem = ModemConfigurator::new(&mut channel, config.session.exchange_timeout());
            match modem.try_initialize().await {
                Ok(()) => modem.try_apply_all(&config.radio).await,
                Err(e) => Err(e),
            }
        };
        channel.close().await;
        result?;
        println!("Everything set");
        Ok(())
    }

    pub async fn start(config: &Config) -> Result<()> {
        let (handle, SessionChannels { mut events, frames }) = SessionHandle::open(config).await?;
        let logger = tokio::spawn(log_frames(config.logging.frame_log.clone(), frames));

        let mut stdin = BufReader::new(tokio::io::stdin()).lines();
        let mut stdin_open = true;
        let mut first_fix: Option<TelemetrySample> = None;
        println!("Listening for rover {}. Commands: bd <lat> <long>, cancel, man1|man2 <w/a/s/d>, raw <KIND> [args], status, close", config.radio.rover_address);

        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Some(event) => report(event, &mut first_fix),
                    None => break,
                },
                line = stdin.next_line(), if stdin_open => match line {
                    Ok(Some(line)) => operator_input(&handle, line.trim()),
                    Ok(None) => {
                        stdin_open = false;
                        let _ = handle.request_close();
                    }
                    Err(e) => {
                        warn!("stdin read failed: {}", e);
                        stdin_open = false;
                    }
                },
                _ = tokio::signal::ctrl_c() => {
                    info!("Interrupted");
                    break;
                }
            }
        }

        handle.shutdown(SHUTDOWN_GRACE).await;
        match logger.await {
            Ok(Err(e)) => warn!("Frame log failed: {}", e),
            Err(e) => warn!("Frame log task failed: {}", e),
            Ok(Ok(())) => {}
        }
        Ok(())
    }

    fn operator_input(handle: &SessionHandle, line: &str) {
        match line {
            "" => {}
            "close" | "quit" => {
                if handle.request_close().is_err() {
                    println!("Session already closed");
                }
            }
            "status" => {
                let status = serde_json::json!({ "session": handle.snapshot(), "metrics": metrics::snapshot() });
                println!("{}", status);
            }
            _ => match Command::parse_console(line).and_then(|cmd| handle.enqueue_command(cmd)) {
                Ok(()) => println!("queued: {}", line),
                Err(e) => println!("{}", e),
            },
        }
    }

    fn report(event: SessionEvent, first_fix: &mut Option<TelemetrySample>) {
        match event {
            SessionEvent::StateChanged { from, to } => println!("link: {} -> {}", from, to),
            SessionEvent::Telemetry(sample) => {
                let start = first_fix.get_or_insert_with(|| sample.clone());
                println!(
                    "{}  pos ({:.2}, {:.2}, {:.2})  lat {:.6}  long {:.6}  alt {:.1} m  distance {:.1} m",
                    sample.vehicle_state,
                    sample.pos_x,
                    sample.pos_y,
                    sample.pos_z,
                    sample.lat,
                    sample.long,
                    sample.altitude,
                    start.distance_to(&sample)
                );
            }
            SessionEvent::CommandDelivered(cmd) => println!("delivered: {}", cmd),
            SessionEvent::Error { kind, detail } => {
                error!("{}: {}", kind, detail);
                eprintln!("error ({}): {}", kind, detail);
            }
        }
    }

    async fn log_frames(path: Option<String>, mut frames: mpsc::UnboundedReceiver<FrameRecord>) -> Result<()> {
        let Some(path) = path else {
            while frames.recv().await.is_some() {}
            return Ok(());
        };
        if let Some(parent) = Path::new(&path).parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).await?;
            }
        }
        let mut file = OpenOptions::new().create(true).append(true).open(&path).await?;
        info!("Logging frames to {}", path);
        while let Some(record) = frames.recv().await {
            file.write_all(format!("{}\n", record).as_bytes()).await?;
        }
        file.flush().await?;
        Ok(())
    }
}
