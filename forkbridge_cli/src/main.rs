use forkbridge_core::config::BridgeConfig;

use clap::Parser;
use std::io::{Read, Write};
use std::path::PathBuf;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

const LOG_ENV_VAR: &str = "FORKBRIDGE_LOG";

/// Demo harness: reads its input from stdin and crashes on inputs shaped
/// like `x??y` at any of the first few offsets.
#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Cli {
    #[clap(short, long, value_parser)]
    config_file: Option<PathBuf>,
    /// Iterations per forked child.
    #[clap(short, long)]
    iterations: Option<u64>,
    /// Run the handshake and first fork before entering the loop.
    #[clap(long)]
    deferred: bool,
    /// Print the process id once per iteration.
    #[clap(long)]
    print_pid: bool,
}

const MAX_OFFSET: usize = 10;

fn hard(data: &[u8]) -> bool {
    data.first() == Some(&b'x') && data.get(3) == Some(&b'y')
}

fn my_harness(data: &[u8]) {
    for offset in 0..=MAX_OFFSET.min(data.len()) {
        if hard(&data[offset..]) {
            panic!("x..y pattern found at offset {offset}");
        }
    }
}

/// Rewinds stdin and reads it to the end. The supervisor rewrites the same
/// file between iterations, so every pass sees the current input.
fn read_input() -> Vec<u8> {
    // A pipe cannot seek; it is simply drained once.
    unsafe {
        libc::lseek(libc::STDIN_FILENO, 0, libc::SEEK_SET);
    }
    let mut data = Vec::new();
    if let Err(e) = std::io::stdin().lock().read_to_end(&mut data) {
        warn!(error = %e, "failed to read input, running with what arrived");
    }
    data
}

fn main() -> Result<(), anyhow::Error> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_env(LOG_ENV_VAR).unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let mut config = match cli.config_file {
        Some(config_path) => {
            info!(?config_path, "loading configuration");
            BridgeConfig::load_from_file(&config_path)?
        }
        None => BridgeConfig::default(),
    };
    config.apply_env_overrides()?;

    if let Some(iterations) = cli.iterations {
        config.harness.get_or_insert_with(Default::default).iterations = iterations;
    }
    let iterations = config.iterations();
    debug!(?config, "effective configuration");

    if !forkbridge_core::configure(config) {
        warn!("bridge session already initialised, configuration ignored");
    }

    if cli.deferred {
        forkbridge_core::init();
    }

    while forkbridge_core::persistent_loop(iterations) {
        let data = read_input();
        if cli.print_pid {
            let mut stdout = std::io::stdout().lock();
            let _ = writeln!(stdout, "{}", std::process::id());
            let _ = stdout.flush();
        }
        my_harness(&data);
    }
    forkbridge_core::force_exit(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::panic::catch_unwind;

    #[test]
    fn harness_accepts_benign_inputs() {
        for input in [&b""[..], b"x", b"xyz", b"hello world", b"xaa"] {
            assert!(
                catch_unwind(|| my_harness(input)).is_ok(),
                "{input:?} should not crash"
            );
        }
    }

    #[test]
    fn harness_crashes_on_pattern() {
        for input in [&b"xaay"[..], b"..xbby", b"0123456789xqqy"] {
            assert!(
                catch_unwind(|| my_harness(input)).is_err(),
                "{input:?} should crash"
            );
        }
    }

    #[test]
    fn pattern_beyond_reach_is_ignored() {
        let input = b"01234567890xqqy";
        assert!(catch_unwind(|| my_harness(input)).is_ok());
    }

    #[test]
    fn cli_parses_flags() {
        let cli = Cli::parse_from(["forkbridge_cli", "-i", "7", "--deferred", "--print-pid"]);
        assert_eq!(cli.iterations, Some(7));
        assert!(cli.deferred);
        assert!(cli.print_pid);
        assert!(cli.config_file.is_none());
    }
}
