use std::{
    io::{BufRead, Write},
    ops::ControlFlow,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use clap::{Parser, Subcommand};
use crossbeam_channel::{Receiver, TryRecvError};
use forest_stage_core::{
    AppConfig, ChannelTransport, DirResolver, Envelope, FixedRateDriver, ManualClock,
    SimulatedBackend, Stage, SystemClock, TransportId,
};
use serde::Deserialize;
use serde_json::Value;
use tracing_subscriber::EnvFilter;

fn main() -> forest_stage_core::Result<()> {
    init_tracing();

    let cli = Cli::parse();

    match cli.command {
        Commands::Live { config } => run_live(config.as_deref()),
        Commands::Replay {
            script,
            config,
            snapshot,
            until,
        } => run_replay(&script, config.as_deref(), snapshot.as_deref(), until),
    }
}

fn run_live(config: Option<&Path>) -> forest_stage_core::Result<()> {
    let config = AppConfig::load_or_default(config)?;
    tracing::info!(fps = config.stage.target_fps, "starting live stage");
    let driver = FixedRateDriver::from_stage(&config.stage);
    let mut host = Host::new(config)?;
    let lines = spawn_stdin_reader()?;

    driver.run(&SystemClock, |now| {
        let mut closed = false;
        loop {
            match lines.try_recv() {
                Ok(line) => host.dispatch_line(&line, now),
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    closed = true;
                    break;
                }
            }
        }
        host.tick(now)?;
        if closed {
            tracing::info!(frames = host.stage.frames(), "input closed, stopping");
            Ok(ControlFlow::Break(()))
        } else {
            Ok(ControlFlow::Continue(()))
        }
    })
}

fn run_replay(
    script: &Path,
    config: Option<&Path>,
    snapshot: Option<&Path>,
    until: Option<f64>,
) -> forest_stage_core::Result<()> {
    let config = AppConfig::load_or_default(config)?;
    let mut steps: Vec<Step> = serde_json::from_str(&std::fs::read_to_string(script)?)?;
    steps.sort_by(|a, b| a.at_ms.total_cmp(&b.at_ms));
    let until = until.unwrap_or_else(|| steps.last().map_or(0.0, |step| step.at_ms) + 2000.0);
    tracing::info!(?script, steps = steps.len(), until, "replaying script");

    let interval = config.stage.frame_interval_ms();
    let mut host = Host::new(config)?;
    let clock = ManualClock::new(0.0);
    let mut pending = steps.into_iter().peekable();

    FixedRateDriver::with_interval(Duration::ZERO).run(&clock, |now| {
        while let Some(step) = pending.next_if(|step| step.at_ms <= now) {
            host.dispatch(step.routed, now);
        }
        host.tick(now)?;
        if clock.advance(interval) > until {
            Ok(ControlFlow::Break(()))
        } else {
            Ok(ControlFlow::Continue(()))
        }
    })?;

    if let Some(path) = snapshot {
        std::fs::write(path, host.stage.renderer().snapshot_png()?)?;
        tracing::info!(?path, "final frame written");
    }
    Ok(())
}

/// A stage wired to stdout through both transports.
struct Host {
    stage: Stage<SimulatedBackend>,
    host: TransportId,
    broadcast: TransportId,
    host_out: Receiver<Envelope>,
    broadcast_out: Receiver<Envelope>,
}

impl Host {
    fn new(config: AppConfig) -> forest_stage_core::Result<Self> {
        let (event_tx, events) = crossbeam_channel::unbounded();
        let (host_tx, host_out) = crossbeam_channel::unbounded();
        let (broadcast_tx, broadcast_out) = crossbeam_channel::unbounded();
        let resolver = Arc::new(DirResolver::new(config.assets.root.clone()));
        let origin = config.transport.origin.clone();
        let notify_broadcast = config.transport.notify_broadcast;

        tracing::info!("audio output is simulated");
        let mut stage = Stage::new(config, SimulatedBackend::new(event_tx), events, resolver)?;
        let host = stage.attach(Box::new(ChannelTransport::host_relay(host_tx)));
        let broadcast = stage.attach(Box::new(
            ChannelTransport::broadcast(origin, broadcast_tx).with_notifications(notify_broadcast),
        ));

        Ok(Self {
            stage,
            host,
            broadcast,
            host_out,
            broadcast_out,
        })
    }

    fn dispatch_line(&mut self, line: &str, now: f64) {
        let line = line.trim();
        if line.is_empty() {
            return;
        }
        match parse_line(line) {
            Some(routed) => self.dispatch(routed, now),
            None => tracing::debug!(line, "ignoring unparsable input line"),
        }
    }

    fn dispatch(&mut self, routed: Routed, now: f64) {
        let from = match routed.channel {
            Channel::Host => self.host,
            Channel::Broadcast => self.broadcast,
        };
        self.stage
            .receive(from, routed.origin.as_deref(), &routed.message, now);
    }

    fn tick(&mut self, now: f64) -> forest_stage_core::Result<()> {
        self.stage.tick(now);

        let mut out = std::io::stdout().lock();
        for envelope in self.host_out.try_iter() {
            writeln!(out, "{}", serde_json::to_string(&envelope)?)?;
        }
        for envelope in self.broadcast_out.try_iter() {
            let routed = serde_json::json!({ "channel": "broadcast", "message": envelope });
            writeln!(out, "{routed}")?;
        }
        out.flush()?;
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
enum Channel {
    #[default]
    Host,
    Broadcast,
}

/// An inbound message together with the transport it arrives on.
#[derive(Debug, Deserialize)]
struct Routed {
    #[serde(default)]
    channel: Channel,
    #[serde(default)]
    origin: Option<String>,
    message: Value,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Step {
    at_ms: f64,
    #[serde(flatten)]
    routed: Routed,
}

/// A line is either a bare `{type, data}` envelope for the host relay or a
/// routed message.
fn parse_line(line: &str) -> Option<Routed> {
    let value: Value = serde_json::from_str(line).ok()?;
    if value.get("type").is_some() {
        return Some(Routed {
            channel: Channel::Host,
            origin: None,
            message: value,
        });
    }
    serde_json::from_value(value).ok()
}

fn spawn_stdin_reader() -> forest_stage_core::Result<Receiver<String>> {
    let (tx, rx) = crossbeam_channel::unbounded();
    std::thread::Builder::new()
        .name("forest-stage-stdin".to_string())
        .spawn(move || {
            for line in std::io::stdin().lock().lines() {
                match line {
                    Ok(line) => {
                        if tx.send(line).is_err() {
                            break;
                        }
                    }
                    Err(err) => {
                        tracing::warn!(%err, "reading stdin failed");
                        break;
                    }
                }
            }
        })?;
    Ok(rx)
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .try_init();
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Forest projection stage", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the stage in real time, reading commands from stdin.
    Live {
        /// Optional JSON configuration file.
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
    /// Replay a timed command script on a simulated clock.
    Replay {
        /// JSON array of `{atMs, channel?, origin?, message}` steps.
        script: PathBuf,
        /// Optional JSON configuration file.
        #[arg(short, long)]
        config: Option<PathBuf>,
        /// Write the final frame to this PNG file.
        #[arg(long)]
        snapshot: Option<PathBuf>,
        /// Stop the simulated clock at this time (ms). Defaults to two
        /// seconds after the last step.
        #[arg(long)]
        until: Option<f64>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bare_envelope_goes_to_host_relay() {
        let routed = parse_line(r#"{"type":"REMOVE_ELEMENT","data":{"id":"owl"}}"#).unwrap();
        assert!(matches!(routed.channel, Channel::Host));
        assert_eq!(routed.message["type"], "REMOVE_ELEMENT");
    }

    #[test]
    fn routed_line_keeps_channel_and_origin() {
        let line = serde_json::json!({
            "channel": "broadcast",
            "origin": "app://stage",
            "message": { "type": "REQUEST_BACKGROUND_SNAPSHOT", "data": {} }
        });
        let routed = parse_line(&line.to_string()).unwrap();
        assert!(matches!(routed.channel, Channel::Broadcast));
        assert_eq!(routed.origin.as_deref(), Some("app://stage"));
    }

    #[test]
    fn garbage_is_ignored() {
        assert!(parse_line("not json").is_none());
        assert!(parse_line(r#"{"channel":"host"}"#).is_none());
    }

    #[test]
    fn script_steps_parse_with_defaults() {
        let steps: Vec<Step> = serde_json::from_str(
            r#"[{"atMs": 250, "message": {"type":"ADD_ELEMENT","data":{"id":"owl"}}}]"#,
        )
        .unwrap();
        assert_eq!(steps[0].at_ms, 250.0);
        assert!(matches!(steps[0].routed.channel, Channel::Host));
        assert!(steps[0].routed.origin.is_none());
    }
}
