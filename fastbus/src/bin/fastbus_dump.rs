//! Prints frames from a CAN interface, candump style.
//!
//! Opens an adaptive receiver on the interface and reports which path
//! serves it. In fast mode the ring is drained without blocking; after a
//! downgrade frames come from the blocking socket.
//!
//! # Usage
//!
//! ```sh
//! cargo run --features dump --bin fastbus-dump -- --channel vcan0 --count 100
//! ```
//!
//! SIGINT or SIGTERM ends the loop; stats are printed and the receiver is
//! shut down before exit.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use signal_hook::consts::{SIGINT, SIGTERM};
use signal_hook::iterator::Signals;
use thiserror::Error;

use fastbus::socketcan::SocketCan;
use fastbus::{AdaptiveReceiver, BusConfig, OpenError, ReceiveError, ReceiverMode};

/// Blocking wait per call once degraded.
const DEGRADED_WAIT: Duration = Duration::from_millis(100);

/// Sleep between empty fast-mode polls.
const IDLE_BACKOFF: Duration = Duration::from_micros(200);

/// Set by the signal thread on SIGINT or SIGTERM.
static SHUTDOWN_REQUESTED: AtomicBool = AtomicBool::new(false);

#[derive(Debug, Error)]
enum DumpError {
    #[error("{0}")]
    Usage(String),
    #[error(transparent)]
    Open(#[from] OpenError),
    #[error(transparent)]
    Receive(#[from] ReceiveError),
    #[error("signal handling: {0}")]
    Signal(#[source] io::Error),
}

struct Args {
    config: BusConfig,
    count: Option<u64>,
}

fn main() {
    fastbus::init_tracing();

    if let Err(e) = run() {
        eprintln!("fastbus-dump: {e}");
        std::process::exit(1);
    }
}

fn run() -> Result<(), DumpError> {
    let args: Vec<String> = std::env::args().collect();
    let Args { config, count } = parse_args(&args)?;
    let channel = config.channel.clone();

    setup_signal_handlers()?;
    let rx = AdaptiveReceiver::open(&SocketCan, config)?;
    match rx.degrade_cause() {
        None => eprintln!("fastbus-dump: {channel} open in fast mode"),
        Some(cause) => eprintln!("fastbus-dump: {channel} open in degraded mode ({cause})"),
    }

    let mut printed = 0u64;
    let mut announced = rx.mode();
    while should_continue(count, printed) {
        let mode = rx.mode();
        if mode != announced {
            if let Some(cause) = rx.degrade_cause() {
                eprintln!("fastbus-dump: switched to degraded mode ({cause})");
            }
            announced = mode;
        }

        let wait = match mode {
            ReceiverMode::Fast => Duration::ZERO,
            ReceiverMode::Degraded => DEGRADED_WAIT,
        };
        match rx.receive(wait)? {
            Some(frame) => {
                println!("({:.6}) {channel} {frame}", frame.timestamp());
                printed += 1;
            }
            None if mode == ReceiverMode::Fast && !rx.is_alive() => {
                // Poll thread gone without a downgrade: nothing more will arrive.
                if rx.mode() == ReceiverMode::Fast {
                    break;
                }
            }
            None if mode == ReceiverMode::Fast => std::thread::sleep(IDLE_BACKOFF),
            None => {}
        }
    }

    if SHUTDOWN_REQUESTED.load(Ordering::Relaxed) {
        eprintln!("\nfastbus-dump: received shutdown signal");
    }
    let stats = rx.stats();
    eprintln!(
        "fastbus-dump: {printed} frame(s), {} dropped, {} downgrade(s)",
        stats.overflow_drops, stats.downgrades
    );
    rx.shutdown();
    Ok(())
}

fn should_continue(count: Option<u64>, printed: u64) -> bool {
    count.is_none_or(|limit| printed < limit) && !SHUTDOWN_REQUESTED.load(Ordering::Relaxed)
}

/// Spawns a thread that raises [`SHUTDOWN_REQUESTED`] on the first SIGINT or
/// SIGTERM.
fn setup_signal_handlers() -> Result<(), DumpError> {
    let mut signals = Signals::new([SIGINT, SIGTERM]).map_err(DumpError::Signal)?;
    std::thread::Builder::new()
        .name("signal-handler".into())
        .spawn(move || {
            let mut received = signals.forever();
            if received.next().is_some() {
                SHUTDOWN_REQUESTED.store(true, Ordering::Relaxed);
            }
            if received.next().is_some() {
                // Second signal: the receive loop is stuck.
                std::process::exit(130);
            }
        })
        .map_err(DumpError::Signal)?;
    Ok(())
}

fn parse_args(args: &[String]) -> Result<Args, DumpError> {
    let mut config = BusConfig::default();
    let mut count = None;

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--channel" | "-c" => config.channel = value(args, &mut i, "--channel")?.to_owned(),
            "--bitrate" | "-b" => {
                let bitrate = value(args, &mut i, "--bitrate")?;
                config.bitrate = Some(parse(bitrate, "--bitrate")?);
            }
            "--count" | "-n" => {
                let n = value(args, &mut i, "--count")?;
                count = Some(parse(n, "--count")?);
            }
            "--fd" => config.fd = true,
            "--no-fast" => config.fast.enabled = false,
            "--help" | "-h" => {
                print_usage();
                std::process::exit(0);
            }
            arg => return Err(DumpError::Usage(format!("unknown argument: {arg}"))),
        }
        i += 1;
    }

    Ok(Args { config, count })
}

fn value<'a>(args: &'a [String], i: &mut usize, flag: &str) -> Result<&'a str, DumpError> {
    *i += 1;
    args.get(*i)
        .map(String::as_str)
        .ok_or_else(|| DumpError::Usage(format!("missing value for {flag}")))
}

fn parse<T>(raw: &str, flag: &str) -> Result<T, DumpError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    raw.parse()
        .map_err(|e| DumpError::Usage(format!("invalid value for {flag}: {e}")))
}

fn print_usage() {
    eprintln!(
        r#"Usage: fastbus-dump [OPTIONS]

Options:
  -c, --channel <IFACE>  CAN interface [default: vcan0]
  -b, --bitrate <BPS>    Nominal bitrate, informational
  -n, --count <N>        Exit after N frames
      --fd               Accept CAN FD frames
      --no-fast          Skip the fast path
  -h, --help             Print this help"#
    );
}
