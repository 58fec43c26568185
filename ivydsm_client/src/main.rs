//! Ivydsm client node process.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use ivydsm::{
    logger_init, pf_error, pf_info, ClientNode, DsmError, NodeRegistry,
};
use log::{self, LevelFilter};
use tokio::runtime::Builder;
use tokio::sync::watch;

/// Command line arguments definition.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct CliArgs {
    /// Address of the acting manager at startup.
    #[arg(short, long, default_value = "127.0.0.1:8000")]
    manager: SocketAddr,

    /// Local IP to listen on.
    #[arg(short, long, default_value_t = Ipv4Addr::LOCALHOST)]
    bind_ip: Ipv4Addr,

    /// Node N listens on port `base_port + N`.
    #[arg(short = 'p', long, default_value_t = 8002)]
    base_port: u16,

    /// Path to the node registry JSON file.
    #[arg(long, default_value = "nodes-list.json")]
    registry: PathBuf,

    /// Client configuration TOML string, with '+' standing for newlines.
    #[arg(short, long, default_value_t = String::from(""))]
    config: String,

    /// Run the workload right away instead of waiting for the manager.
    #[arg(long)]
    autostart: bool,

    /// Number of tokio worker threads.
    #[arg(long, default_value_t = 4)]
    threads: usize,
}

impl CliArgs {
    /// Sanitize command line arguments, return `Ok(())` on success or
    /// `Err(DsmError)` on any error.
    fn sanitize(&self) -> Result<(), DsmError> {
        if self.base_port <= 1024 {
            Err(DsmError::msg(format!(
                "invalid base_port {}",
                self.base_port
            )))
        } else if self.threads < 2 {
            Err(DsmError::msg(format!(
                "invalid number of threads {}",
                self.threads
            )))
        } else {
            Ok(())
        }
    }
}

/// Actual main function of the client.
fn client_main() -> Result<(), DsmError> {
    // read in and parse command line arguments
    let args = CliArgs::parse();
    args.sanitize()?;

    // take a node ID and port from the registry
    let registry = NodeRegistry::new(&args.registry);
    let me = registry.join(IpAddr::V4(args.bind_ip), args.base_port)?;
    let name = format!("n{}", me.id);
    pf_info!(name; "registered as {} in '{}'", me, registry.path().display());

    // set up termination signals handler
    let (tx_term, mut rx_term) = watch::channel(false);
    let handler_name = name.clone();
    ctrlc::set_handler(move || {
        if let Err(e) = tx_term.send(true) {
            pf_error!(handler_name; "error sending to term channel: {}", e);
        }
    })?;

    let config_str = args.config.replace('+', "\n");

    let log_level = log::max_level();
    let result = {
        // create tokio multi-threaded runtime
        let runtime = Builder::new_multi_thread()
            .enable_all()
            .worker_threads(args.threads)
            .thread_name("tokio-worker-client")
            .build()?;

        // enter tokio runtime, set up the node, and serve until killed
        runtime.block_on(async move {
            let config = (!config_str.is_empty()).then_some(&config_str[..]);
            let node = ClientNode::new_and_setup(me, args.manager, config).await?;
            if args.autostart {
                node.client().spawn_workload();
            }

            let _ = rx_term.changed().await;
            node.terminate();

            // suppress logging before dropping the runtime to avoid spurious
            // error messages
            log::set_max_level(LevelFilter::Off);

            Ok::<(), DsmError>(()) // give type hint for this async closure
        })
    }; // drop the runtime here

    log::set_max_level(log_level);
    registry.leave(me.id)?;
    pf_info!(name; "left registry");
    result
}

/// Main function of the client.
fn main() -> ExitCode {
    logger_init();

    if let Err(ref e) = client_main() {
        pf_error!("client"; "client_main exited: {}", e);
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    }
}

#[cfg(test)]
mod arg_tests {
    use super::*;

    fn args(base_port: u16, threads: usize) -> CliArgs {
        CliArgs {
            manager: "127.0.0.1:8000".parse().unwrap(),
            bind_ip: Ipv4Addr::LOCALHOST,
            base_port,
            registry: "nodes-list.json".into(),
            config: "".into(),
            autostart: false,
            threads,
        }
    }

    #[test]
    fn sanitize_valid() {
        assert_eq!(args(8002, 2).sanitize(), Ok(()));
    }

    #[test]
    fn sanitize_invalid_base_port() {
        assert!(args(1024, 4).sanitize().is_err());
    }

    #[test]
    fn sanitize_invalid_threads() {
        assert!(args(8002, 1).sanitize().is_err());
    }
}
