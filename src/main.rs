use clap::{Parser, Subcommand};

use revnet::app::{self, Mode};

#[derive(Debug, Parser)]
#[command(
    name = "revnet",
    version,
    about = "revnet - serve from behind NAT by letting the server dial the relay"
)]
struct Cli {
    /// Path to a config file (.toml/.yaml/.yml). Flags override its values.
    #[arg(long, env = "REVNET_CONFIG", global = true)]
    config: Option<std::path::PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the public relay.
    Relay {
        /// Address reversed listeners dial into (e.g. ":9000").
        #[arg(long)]
        tunnel: Option<String>,
        /// Address ordinary clients connect to (e.g. ":8080").
        #[arg(long)]
        public: Option<String>,
    },
    /// Expose a local service through a relay.
    Expose {
        /// Relay tunnel address (host:port).
        #[arg(long)]
        relay: Option<String>,
        /// Local service address (host:port).
        #[arg(long)]
        local: Option<String>,
        /// Concurrent accepts kept open against the relay.
        #[arg(long)]
        workers: Option<usize>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let mode = match cli.command {
        Command::Relay { tunnel, public } => Mode::Relay {
            tunnel_addr: tunnel,
            public_addr: public,
        },
        Command::Expose {
            relay,
            local,
            workers,
        } => Mode::Expose {
            relay_addr: relay,
            local_addr: local,
            workers,
        },
    };
    app::run(cli.config, mode).await
}
