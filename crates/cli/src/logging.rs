//! Stderr logging for the relay binary.

use std::io::Write;

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::cli::{Cli, LogFormat};

/// Crates whose DEBUG output is transport chatter; held at INFO unless asked for.
const NOISY_SSH_CRATES: &[&str] = &["russh", "russh_keys", "ssh_key"];

/// A writer that wraps stderr and flushes after each write.
/// This ensures log lines are immediately visible when stderr is piped.
struct FlushingStderr;

impl Write for FlushingStderr {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let stderr = std::io::stderr();
        let mut handle = stderr.lock();
        let n = handle.write(buf)?;
        handle.flush()?;
        Ok(n)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        std::io::stderr().flush()
    }
}

/// Install the global subscriber. `RUST_LOG` wins over `--log-level`.
pub fn init_logging(cli: &Cli) {
    let rust_log = std::env::var("RUST_LOG").unwrap_or_default();
    let mut filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&cli.log_level));

    if !wants_verbose_ssh(&cli.log_level, &rust_log) {
        for krate in NOISY_SSH_CRATES {
            if let Ok(directive) = format!("{krate}=info").parse() {
                filter = filter.add_directive(directive);
            }
        }
    }

    let use_color = cli.color.should_enable();

    match cli.log_format {
        LogFormat::Json => {
            tracing_subscriber::registry()
                .with(filter)
                .with(
                    fmt::layer()
                        .json()
                        .with_target(true)
                        .with_span_list(true)
                        .with_writer(|| FlushingStderr),
                )
                .init();
        }
        LogFormat::Compact => {
            tracing_subscriber::registry()
                .with(filter)
                .with(
                    fmt::layer()
                        .compact()
                        .with_ansi(use_color)
                        .with_target(false)
                        .with_writer(|| FlushingStderr),
                )
                .init();
        }
        LogFormat::Pretty => {
            tracing_subscriber::registry()
                .with(filter)
                .with(
                    fmt::layer()
                        .pretty()
                        .with_ansi(use_color)
                        .with_target(false)
                        .with_writer(|| FlushingStderr),
                )
                .init();
        }
    }
}

/// SSH internals are shown at DEBUG only when TRACE is requested or the user
/// names one of those crates in `RUST_LOG`.
fn wants_verbose_ssh(log_level: &str, rust_log: &str) -> bool {
    log_level.eq_ignore_ascii_case("trace")
        || NOISY_SSH_CRATES.iter().any(|krate| rust_log.contains(krate))
}
