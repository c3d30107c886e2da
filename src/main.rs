//! Runs one modem outside a network simulator.
//!
//! Every stdin line becomes a DOWN packet for the configured device and every
//! packet the device delivers is printed on stdout. Lines starting with `!`
//! are driver commands, e.g. `!setBurstMode` or `!setSourceLevel 2`.

use anyhow::Context;
use clap::Parser;
use log::{LevelFilter, debug, error, info};
use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::mpsc::{self, Receiver, TryRecvError};
use std::thread;
use uwmodem_bridge::config::ModemConfig;
use uwmodem_bridge::driver::{CommandOutcome, build_modem};
use uwmodem_bridge::logging::init_logging;
use uwmodem_bridge::sim::{ModemAdapter, Packet, PhysicalLayerPort, VirtualClock};

/// Simulated seconds to keep draining events after stdin closes.
const LINGER_SECS: f64 = 2.0;

/// Bridge stdin/stdout to an underwater acoustic modem.
#[derive(Parser)]
#[command(author, version, about)]
struct Args {
    /// Modem configuration file (TOML).
    #[arg(short, long)]
    config: PathBuf,

    /// Simulation speed in percent of real time.
    #[arg(short, long, default_value_t = 100)]
    speed: u32,

    /// MAC destination of outgoing packets.
    #[arg(short, long, default_value_t = 0)]
    dest: u32,

    /// Debug output for this crate.
    #[arg(short, long)]
    verbose: bool,
}

/// Host side of the harness: prints what the modem hands up.
struct StdioPort {
    clock: Arc<VirtualClock>,
    out: io::Stdout,
}

impl PhysicalLayerPort for StdioPort {
    fn now(&self) -> f64 {
        self.clock.now_secs()
    }

    fn send_up(&mut self, packet: Packet, delay: f64) {
        let mut out = self.out.lock();
        let written = writeln!(out, "{}", String::from_utf8_lossy(&packet.payload)).and_then(|()| out.flush());
        if let Err(e) = written {
            error!("cannot write packet {} to stdout: {}", packet.uid, e);
        }
        debug!("packet {} up after {:.3}s", packet.uid, delay);
    }

    fn notify_start_rx(&mut self, packet: &Packet) {
        debug!("reception of packet {} at {:.3}", packet.uid, self.now());
    }

    fn notify_end_tx(&mut self, packet: &Packet) {
        info!("packet {} transmitted at {:.3}", packet.uid, self.now());
    }
}

fn spawn_stdin_reader() -> io::Result<Receiver<String>> {
    let (tx, rx) = mpsc::channel();
    thread::Builder::new().name("stdin".to_string()).spawn(move || {
        for line in io::stdin().lock().lines() {
            let Ok(line) = line else {
                break;
            };
            if tx.send(line).is_err() {
                break;
            }
        }
    })?;
    Ok(rx)
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_logging(if args.verbose { LevelFilter::Debug } else { LevelFilter::Info });

    let config = ModemConfig::load(&args.config)?;
    let modem = build_modem(&config)?;
    let clock = Arc::new(VirtualClock::new(args.speed));
    let port = StdioPort {
        clock: Arc::clone(&clock),
        out: io::stdout(),
    };
    let mut adapter = ModemAdapter::new(modem, port).with_period(config.period);
    adapter
        .start()
        .with_context(|| format!("cannot start modem {} at {}", config.id, config.address))?;
    info!("modem {} running at {}% speed", config.id, clock.speed_percent());

    let lines = spawn_stdin_reader().context("cannot spawn the stdin reader")?;
    let mut linger_until: Option<f64> = None;
    loop {
        loop {
            match lines.try_recv() {
                Ok(line) => handle_line(&mut adapter, &line, args.dest),
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    linger_until.get_or_insert(clock.now_secs() + LINGER_SECS);
                    break;
                }
            }
        }
        let period = adapter.check_events();
        if linger_until.is_some_and(|until| clock.now_secs() >= until) {
            break;
        }
        thread::sleep(clock.real_delay_for(period));
    }

    adapter.stop();
    let stats = adapter.modem().stats();
    info!(
        "stopped: {} sent, {} dropped, {} timeouts, {} received",
        stats.tx_sent, stats.tx_dropped, stats.tx_timeouts, stats.rx_delivered
    );
    Ok(())
}

fn handle_line(adapter: &mut ModemAdapter<StdioPort>, line: &str, dest: u32) {
    if let Some(command) = line.strip_prefix('!') {
        let args: Vec<&str> = command.split_whitespace().collect();
        match adapter.command(&args) {
            Ok(CommandOutcome::Reply(reply)) => info!("{}: {}", command.trim(), reply),
            Ok(CommandOutcome::Handled) => debug!("{}: done", command.trim()),
            Err(e) => error!("{}", e),
        }
        return;
    }
    adapter.recv(Packet::outbound(line.as_bytes().to_vec(), dest));
}
