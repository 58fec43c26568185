//! Ivydsm central manager process, primary or backup.

mod console;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, ValueEnum};
use console::ManagerConsole;
use ivydsm::{
    logger_init, pf_error, CmRole, DsmError, ManagerNode, NodeRegistry,
};
use log::{self, LevelFilter};
use tokio::runtime::Builder;
use tokio::sync::watch;

/// Which manager of the pair this process is.
#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
enum RoleArg {
    Primary,
    Backup,
}

/// Command line arguments definition.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct CliArgs {
    /// Manager role to start in.
    #[arg(short, long, value_enum, default_value_t = RoleArg::Primary)]
    role: RoleArg,

    /// Primary manager address.
    #[arg(long, default_value = "127.0.0.1:8000")]
    primary: SocketAddr,

    /// Backup manager address.
    #[arg(long, default_value = "127.0.0.1:8001")]
    backup: SocketAddr,

    /// Path to the node registry JSON file.
    #[arg(long, default_value = "nodes-list.json")]
    registry: PathBuf,

    /// Manager configuration TOML string, with '+' standing for newlines.
    #[arg(short, long, default_value_t = String::from(""))]
    config: String,

    /// Number of tokio worker threads.
    #[arg(long, default_value_t = 4)]
    threads: usize,
}

impl CliArgs {
    /// Sanitize command line arguments, return `Ok(role)` on success or
    /// `Err(DsmError)` on any error.
    fn sanitize(&self) -> Result<CmRole, DsmError> {
        if self.primary == self.backup {
            Err(DsmError::msg(format!(
                "primary == backup {}",
                self.primary
            )))
        } else if self.threads < 2 {
            Err(DsmError::msg(format!(
                "invalid number of threads {}",
                self.threads
            )))
        } else {
            Ok(match self.role {
                RoleArg::Primary => CmRole::Primary,
                RoleArg::Backup => CmRole::Standby,
            })
        }
    }
}

/// Actual main function of the manager.
fn manager_main() -> Result<(), DsmError> {
    // read in and parse command line arguments
    let args = CliArgs::parse();
    let role = args.sanitize()?;
    let me = match role {
        CmRole::Primary => "cm-primary",
        _ => "cm-backup",
    };

    // set up termination signals handler
    let (tx_term, rx_term) = watch::channel(false);
    ctrlc::set_handler(move || {
        if let Err(e) = tx_term.send(true) {
            pf_error!(me; "error sending to term channel: {}", e);
        }
    })?;

    let config_str = args.config.replace('+', "\n");
    let registry = NodeRegistry::new(&args.registry);

    let log_level = log::max_level();
    {
        // create tokio multi-threaded runtime
        let runtime = Builder::new_multi_thread()
            .enable_all()
            .worker_threads(args.threads)
            .thread_name("tokio-worker-manager")
            .build()?;

        // enter tokio runtime, set up the manager, and serve the console
        // until killed
        runtime.block_on(async move {
            let config = (!config_str.is_empty()).then_some(&config_str[..]);
            let manager = ManagerNode::new_and_setup(
                role,
                args.primary,
                args.backup,
                registry,
                config,
            )
            .await?;

            ManagerConsole::new(manager, role).run(rx_term).await?;

            // suppress logging before dropping the runtime to avoid spurious
            // error messages
            log::set_max_level(LevelFilter::Off);

            Ok::<(), DsmError>(()) // give type hint for this async closure
        })?;
    } // drop the runtime here

    log::set_max_level(log_level);
    Ok(())
}

/// Main function of the manager.
fn main() -> ExitCode {
    logger_init();

    if let Err(ref e) = manager_main() {
        pf_error!("manager"; "manager_main exited: {}", e);
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    }
}
