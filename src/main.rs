//! rootlink entry point.
//!
//! Bootstraps the client runtime with:
//! - Logging initialization
//! - Configuration loading
//! - Signal handling for a clean disconnect
//!
//! ## CLI Subcommands
//!
//! - `rootlink connect` - Establish a session and hold it until Ctrl-C
//! - `rootlink status` - Probe the companion (exit 0/3)
//! - `rootlink start` / `rootlink stop` - Control the companion process
//! - `rootlink config` - Show, list defaults, or validate configuration

use std::process::ExitCode;

use rootlink::cli::{self, config_cmd, exit_codes};
use rootlink::config as link_config;
use rootlink::telemetry::{init_logging, LogConfig};
use rootlink::LinkRuntime;

#[tokio::main]
async fn main() -> ExitCode {
    let args: Vec<String> = std::env::args().collect();
    let command = args.get(1).map(|s| s.as_str()).unwrap_or("help");

    if let Err(e) = init_logging(&LogConfig::from_env()) {
        eprintln!("Logging disabled: {e}");
    }

    let code = match command {
        "connect" => {
            let hold = !args.iter().any(|a| a == "--once");
            with_runtime(|runtime| async move {
                let code = cli::run_connect(&runtime).await;
                if code == exit_codes::SUCCESS && hold {
                    println!("Holding session; press Ctrl-C to disconnect.");
                    let _ = tokio::signal::ctrl_c().await;
                }
                (runtime, code)
            })
            .await
        }
        "status" => {
            let json = args.get(2).map(|s| s.as_str()) == Some("--json");
            with_runtime(|runtime| async move {
                let code = cli::run_status(&runtime, json).await;
                (runtime, code)
            })
            .await
        }
        "start" => {
            with_runtime(|runtime| async move {
                let code = cli::run_start(&runtime).await;
                (runtime, code)
            })
            .await
        }
        "stop" => {
            with_runtime(|runtime| async move {
                let code = cli::run_stop(&runtime).await;
                (runtime, code)
            })
            .await
        }
        "config" => {
            let subcommand = args.get(2).map(|s| s.as_str()).unwrap_or("show");
            match subcommand {
                "show" if args.get(3).map(|s| s.as_str()) == Some("--json") => {
                    config_cmd::run_show_json()
                }
                "show" => {
                    config_cmd::run_show();
                    exit_codes::SUCCESS
                }
                "defaults" => {
                    config_cmd::run_defaults();
                    exit_codes::SUCCESS
                }
                "validate" => config_cmd::run_validate(),
                _ => {
                    eprintln!("Unknown config subcommand: {}", subcommand);
                    print_command_help("config");
                    exit_codes::FAILURE
                }
            }
        }
        "help" | "--help" | "-h" => {
            if let Some(subcommand) = args.get(2) {
                print_command_help(subcommand);
            } else {
                print_usage();
            }
            exit_codes::SUCCESS
        }
        "version" | "--version" | "-V" => {
            println!(
                "rootlink {} (protocol {})",
                env!("CARGO_PKG_VERSION"),
                rootlink::ipc::PROTOCOL_VERSION
            );
            exit_codes::SUCCESS
        }
        _ => {
            eprintln!("Unknown command: {}", command);
            print_usage();
            exit_codes::FAILURE
        }
    };

    ExitCode::from(code.clamp(0, 255) as u8)
}

/// Build the runtime, run `f`, then close the runtime.
async fn with_runtime<F, Fut>(f: F) -> i32
where
    F: FnOnce(LinkRuntime) -> Fut,
    Fut: std::future::Future<Output = (LinkRuntime, i32)>,
{
    let runtime = LinkRuntime::new(link_config::load());
    let (runtime, code) = f(runtime).await;
    runtime.close().await;
    code
}

fn print_usage() {
    let version = env!("CARGO_PKG_VERSION");
    eprintln!(
        "rootlink - session client for the privileged companion daemon v{}

USAGE:
    rootlink [COMMAND] [OPTIONS]

COMMANDS:
    connect      Establish an authenticated session
    status       Probe the companion without starting it
    start        Start the companion, deploying it if needed
    stop         Stop the companion
    config       Manage configuration (show, defaults, validate)
    version      Show version information
    help         Show this help message

EXAMPLES:
    rootlink connect                 # Connect and hold the session
    rootlink connect --once          # Connect, report, and exit
    rootlink status --json           # Machine-readable probe
    rootlink config validate         # Validate configuration

ENVIRONMENT:
    ROOTLINK_SOCKET_PATH  Companion socket path
    ROOTLINK_STATE_DIR    Client key, instance id, and audit log directory
    ROOTLINK_LOG          Log filter (e.g. info, rootlink=debug)
    ROOTLINK_LOG_FORMAT   json (default) or pretty
    ROOTLINK_LOG_FILE     Write logs to a file instead of stderr

EXIT CODES:
    0  Success
    1  Failure
    2  Configuration error
    3  Connection error
",
        version
    );
}

/// Print detailed help for a specific command.
fn print_command_help(command: &str) {
    match command {
        "connect" => {
            eprintln!(
                "rootlink connect - Establish a session

USAGE:
    rootlink connect [--once]

DESCRIPTION:
    Starts the companion if needed, provisions the client key, authenticates,
    and replays the last configuration. Without --once the session is held
    until Ctrl-C, reconnecting automatically if the companion restarts.
"
            );
        }
        "status" => {
            eprintln!(
                "rootlink status - Probe the companion

USAGE:
    rootlink status [--json]

DESCRIPTION:
    Connects to the companion socket without starting the companion or
    authenticating, and reports protocol version, capabilities, and pid.

EXIT CODES:
    0  Companion reachable
    3  Companion unreachable
"
            );
        }
        "start" | "stop" => {
            eprintln!(
                "rootlink start|stop - Control the companion process

USAGE:
    rootlink start
    rootlink stop

DESCRIPTION:
    start verifies root access, deploys the bundled binary when the installed
    one differs, launches it, and verifies the protocol version. A mismatch
    triggers one forced redeploy before failing.

    stop sends SIGTERM and escalates to SIGKILL after a grace period.
"
            );
        }
        "config" => {
            eprintln!(
                "rootlink config - Manage configuration

USAGE:
    rootlink config show [--json]
    rootlink config defaults
    rootlink config validate
"
            );
        }
        _ => print_usage(),
    }
}
