use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::fmt;
use tracing_subscriber::prelude::*;

use nslock::config::{Cli, Command, LockConfig, StressConfig};
use nslock::stress::run_stress;

/// Set by SIGINT/SIGTERM; workers poll it between operations.
static SHUTDOWN: AtomicBool = AtomicBool::new(false);

extern "C" fn signal_handler(_sig: libc::c_int) {
    SHUTDOWN.store(true, Ordering::Relaxed);
}

fn install_signal_handlers() {
    unsafe {
        use nix::sys::signal::{signal, SigHandler, Signal};
        signal(Signal::SIGINT, SigHandler::Handler(signal_handler)).ok();
        signal(Signal::SIGTERM, SigHandler::Handler(signal_handler)).ok();
    }
}

fn main() {
    let cli = Cli::parse();

    match cli.command {
        Command::Stress {
            policy,
            timeout_ms,
            threads,
            paths,
            depth,
            duration_secs,
            hold_micros,
            write_ratio,
            seed,
            log_file,
            show_status,
        } => {
            // Set up logging
            let log_dir = log_file.parent().unwrap_or_else(|| std::path::Path::new("/tmp"));
            let log_name = log_file
                .file_name()
                .unwrap_or_else(|| std::ffi::OsStr::new("nslock.log"));
            let file_appender = tracing_appender::rolling::never(log_dir, log_name);
            let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);

            let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

            let subscriber = tracing_subscriber::registry()
                .with(env_filter)
                .with(
                    fmt::layer()
                        .with_writer(non_blocking)
                        .with_ansi(false)
                        .with_target(false),
                )
                .with(
                    fmt::layer()
                        .with_writer(std::io::stderr)
                        .with_target(false),
                );
            tracing::subscriber::set_global_default(subscriber)
                .expect("Failed to set tracing subscriber");

            let config = StressConfig {
                lock: LockConfig::new(policy, Duration::from_millis(timeout_ms)),
                threads,
                paths,
                depth,
                duration: Duration::from_secs(duration_secs),
                hold: Duration::from_micros(hold_micros),
                write_ratio,
                seed,
            };

            install_signal_handlers();

            let report = match run_stress(&config, &SHUTDOWN, show_status) {
                Ok(report) => report,
                Err(e) => {
                    error!("Stress run failed: {}", e);
                    eprintln!("Error: {}", e);
                    std::process::exit(1);
                }
            };

            if SHUTDOWN.load(Ordering::Relaxed) {
                info!("Stress run stopped early by signal");
            }

            match serde_json::to_string_pretty(&report) {
                Ok(json) => println!("{}", json),
                Err(e) => {
                    eprintln!("Error: failed to encode report: {}", e);
                    std::process::exit(1);
                }
            }

            if report.residual_nodes != 0 || report.residual_holds != 0 {
                error!(
                    "Lock tree not empty after run: {} nodes, {} holds",
                    report.residual_nodes, report.residual_holds
                );
                std::process::exit(2);
            }
        }
    }
}
