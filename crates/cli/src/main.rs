use std::time::Duration;

use cardbridge::{BridgeConfig, CardBridge, CardService};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

mod commands;
mod utils;

use commands::*;
use utils::simulate;

#[derive(Parser)]
#[command(version, about = "List card readers, watch card taps and send APDUs over PC/SC")]
struct Cli {
    /// Optional reader name to use (will auto-detect if not specified)
    #[arg(short, long, global = true)]
    reader: Option<String>,

    /// Number of transmit workers
    #[arg(long, default_value_t = 4, global = true)]
    workers: usize,

    /// Listener status poll interval in milliseconds
    #[arg(long, default_value_t = 1000, global = true)]
    poll_ms: u64,

    /// Use simulated readers instead of the system PC/SC service
    #[arg(long, global = true)]
    simulate: bool,

    /// Debug level output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List available readers
    List,

    /// Show the current status of a reader
    Status,

    /// Print the UID of every card tapped on a reader
    Listen {
        /// Stop after this many UIDs (default: until Enter is pressed)
        #[arg(short, long)]
        count: Option<usize>,
    },

    /// Send an APDU to the card and print the response
    Transmit {
        /// APDU as a hex string, e.g. "00A4040000"
        #[arg(required = true)]
        apdu: String,
    },
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Parse command line arguments
    let cli = Cli::parse();

    // Setup logging based on verbosity
    setup_logging(cli.verbose);

    let config = BridgeConfig::default()
        .with_transmit_workers(cli.workers)
        .with_poll_interval(Duration::from_millis(cli.poll_ms));

    if cli.simulate {
        info!("Using simulated readers");
        let service = simulate::service();
        let _tapper = matches!(cli.command, Commands::Listen { .. })
            .then(|| simulate::start_tapping(service.clone()));
        run(CardBridge::with_service(service, config), &cli)
    } else {
        run(CardBridge::new(config), &cli)
    }
}

fn run<S: CardService>(bridge: CardBridge<S>, cli: &Cli) -> Result<(), Box<dyn std::error::Error>> {
    match &cli.command {
        Commands::List => list_command(&bridge),
        Commands::Status => {
            let reader = utils::reader::select(&bridge, cli.reader.as_deref(), false)?;
            status_command(&bridge, &reader)
        }
        Commands::Listen { count } => {
            let reader = utils::reader::select(&bridge, cli.reader.as_deref(), false)?;
            info!("Using reader: {}", reader);
            listen_command(bridge, &reader, *count)
        }
        Commands::Transmit { apdu } => {
            let reader = utils::reader::select(&bridge, cli.reader.as_deref(), true)?;
            info!("Using reader: {}", reader);
            transmit_command(&bridge, &reader, apdu)
        }
    }
}

fn setup_logging(verbose: bool) {
    let level = if verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };

    // RUST_LOG still takes precedence over the default level
    let filter = EnvFilter::builder()
        .with_default_directive(level.into())
        .from_env_lossy();

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_ansi(true)
        .init();
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_options_after_subcommand() {
        let cli = Cli::try_parse_from([
            "cardbridge", "listen", "--simulate", "--workers", "2", "--poll-ms", "50", "-c", "3",
        ])
        .unwrap();
        assert!(cli.simulate);
        assert_eq!(cli.workers, 2);
        assert_eq!(cli.poll_ms, 50);
        assert!(matches!(cli.command, Commands::Listen { count: Some(3) }));
    }
}
