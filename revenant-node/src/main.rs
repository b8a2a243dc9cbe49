// Revenant node: UDP broadcast transport, presence and file transfer with a line-based terminal front end.

mod command;
mod config;
mod logging;
mod presence;
mod session;
mod transfer;
mod transport;

use std::path::PathBuf;

use clap::Parser;
use revenant_core::Event;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;

use crate::command::Command;
use crate::session::{Session, Settings};

#[derive(Debug, Parser)]
#[command(name = "revenant", version, about = "Encrypted LAN chat and file drop over UDP broadcast")]
struct Cli {
    /// Config file (default: ~/.config/revenant/config.toml, then /etc/revenant/config.toml)
    #[arg(short, long)]
    config: Option<PathBuf>,
    /// Display name
    #[arg(short, long)]
    username: Option<String>,
    /// Room secret shared by everyone in the room
    #[arg(short = 's', long = "secret")]
    room_secret: Option<String>,
    /// UDP port
    #[arg(short, long)]
    port: Option<u16>,
    /// Directory for received files
    #[arg(short, long)]
    download_dir: Option<PathBuf>,
    /// Print events as JSON lines instead of text
    #[arg(long)]
    json: bool,
    /// Log level when REVENANT_LOG is unset
    #[arg(long, default_value = "info", value_parser = parse_level)]
    log_level: String,
}

fn parse_level(s: &str) -> Result<String, String> {
    if logging::level_is_valid(s) {
        Ok(s.to_owned())
    } else {
        Err(format!("unknown log level '{s}'"))
    }
}

impl Cli {
    fn overrides(&self) -> config::Overrides {
        config::Overrides {
            config: self.config.clone(),
            username: self.username.clone(),
            room_secret: self.room_secret.clone(),
            port: self.port,
            download_dir: self.download_dir.clone(),
        }
    }
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    logging::init(&cli.log_level);

    let cfg = config::load(&cli.overrides()).map_err(|e| {
        tracing::error!(error = %e, "configuration error");
        e
    })?;

    let rt = tokio::runtime::Runtime::new()?;
    let result = rt.block_on(run(cli, cfg));
    // the stdin reader thread cannot be cancelled
    rt.shutdown_background();
    result
}

async fn run(cli: Cli, cfg: config::Config) -> anyhow::Result<()> {
    let (events_tx, mut events_rx) = mpsc::unbounded_channel::<Event>();
    let json = cli.json;
    let printer = tokio::spawn(async move {
        while let Some(event) = events_rx.recv().await {
            if json {
                match serde_json::to_string(&event) {
                    Ok(line) => println!("{line}"),
                    Err(e) => tracing::warn!(error = %e, "event not serializable"),
                }
            } else if !matches!(event, Event::Typing { .. } | Event::FileReceiveProgress { .. }) {
                println!("{event}");
            }
        }
    });

    let mut session = Session::new(Settings::from(&cfg), events_tx);
    if let Err(e) = session.start().await {
        tracing::error!(error = %e, "networking unavailable");
        eprintln!("! networking unavailable ({e}); fix the configuration and /reload");
    }
    println!(
        "* {} in room on port {} (/help for commands)",
        session.settings().username,
        session.settings().port
    );

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);
    loop {
        let line = tokio::select! {
            line = lines.next_line() => line?,
            result = &mut shutdown => {
                result?;
                break;
            }
        };
        let Some(line) = line else { break };
        match Command::parse(&line) {
            Command::Say(text) => {
                if let Err(e) = session.send_text(&text).await {
                    eprintln!("! not sent: {e}");
                }
            }
            Command::File(path) => {
                if let Err(e) = session.send_file(&path).await {
                    tracing::debug!(error = %e, "file rejected");
                }
            }
            Command::Typing => {
                if let Err(e) = session.send_typing().await {
                    tracing::warn!(error = %e, "typing ping failed");
                }
            }
            Command::Peers => {
                let names = session.peer_names().await;
                println!("* {} in room: {}", session.peer_count().await, names.join(", "));
            }
            Command::Reload => match config::load(&cli.overrides()) {
                Ok(cfg) => {
                    if let Err(e) = session.reload(Settings::from(&cfg)).await {
                        eprintln!("! reload left networking offline: {e}");
                    }
                }
                Err(e) => eprintln!("! config not reloaded: {e}"),
            },
            Command::Quit => break,
            Command::Help => println!("{}", command::HELP),
            Command::Empty => {}
            Command::Unknown(name) => eprintln!("! unknown command /{name} (try /help)"),
        }
    }

    session.stop().await;
    drop(session);
    let _ = printer.await;
    Ok(())
}

/// Wait for Ctrl+C or SIGTERM (Unix).
async fn shutdown_signal() -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        tokio::select! {
            r = tokio::signal::ctrl_c() => r?,
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
    }
    Ok(())
}
