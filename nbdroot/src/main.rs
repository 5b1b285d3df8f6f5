//! Entry point for the nbdroot boot hook.

#[cfg(not(target_os = "linux"))]
compile_error!("nbdroot is Linux-only; build with a Linux target");

#[cfg(target_os = "linux")]
use clap::Parser;
#[cfg(target_os = "linux")]
use nbdroot::config::{Cli, Command};
#[cfg(target_os = "linux")]
use nbdroot::report::{BootOutcomeReporter, KmsgSink};
#[cfg(target_os = "linux")]
use nbdroot::sequence::{BootSequence, Host};
#[cfg(target_os = "linux")]
use std::process::ExitCode;

#[cfg(target_os = "linux")]
fn main() -> ExitCode {
    // A panic must still leave a non-zero status for the boot framework
    std::panic::set_hook(Box::new(|panic_info| {
        eprintln!("[PANIC] nbdroot panicked: {}", panic_info);
        std::process::exit(1);
    }));

    nbdroot::logging::init();

    let cli = Cli::parse();

    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("nbdroot: failed to start runtime: {}", e);
            return ExitCode::from(1);
        }
    };

    let code = runtime.block_on(async move {
        let config = cli.config;
        let host = Host::linux(&config);
        let sequence = BootSequence::new(&config, &host);

        let outcome = match cli.command.unwrap_or(Command::Run) {
            Command::Run => sequence.run().await,
            Command::ParseCmdline => sequence.parse_only(),
            Command::Connect => sequence.run_from_state_file().await,
        };

        let mut reporter = BootOutcomeReporter::new(Box::new(KmsgSink::new(&config.kmsg_path)))
            .with_report_file(config.report_file.clone());
        reporter.report(&outcome)
    });

    // Blocking work left behind by a stalled stage must not hold the exit status
    runtime.shutdown_background();
    ExitCode::from(code)
}
