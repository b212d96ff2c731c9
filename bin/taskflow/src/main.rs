mod commands;

use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "taskflow")]
#[command(about = "Plan-and-execute task flows over pluggable capabilities", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Write default config, profiles and directories
    Init {
        /// Overwrite an existing config.json
        #[arg(long)]
        force: bool,
    },

    /// Interactive conversation with the engine
    Chat {
        /// Conversation ID
        #[arg(short, long, default_value = "cli:default")]
        conversation: String,
    },

    /// Send one message and print every reply it produces
    Send {
        message: String,

        /// Conversation ID
        #[arg(short, long, default_value = "cli:default")]
        conversation: String,
    },

    /// Inspect and run registered capabilities
    Capabilities {
        #[command(subcommand)]
        command: CapabilitiesCommands,
    },

    /// Inspect profiles
    Profiles {
        #[command(subcommand)]
        command: ProfilesCommands,
    },
}

#[derive(Subcommand)]
enum CapabilitiesCommands {
    /// List capabilities (as seen by a conversation when one is given)
    List {
        /// Apply this conversation's profile visibility
        #[arg(short, long)]
        conversation: Option<String>,

        /// Only names starting with `<group>_`
        #[arg(short, long)]
        group: Option<String>,
    },
    /// Run a single capability against a fresh state
    Run {
        name: String,

        /// Parameters as a JSON object
        #[arg(short, long)]
        params: Option<String>,
    },
}

#[derive(Subcommand)]
enum ProfilesCommands {
    /// List profile names
    List,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();

    match cli.command {
        Commands::Init { force } => {
            commands::init::run(force).await?;
        }
        Commands::Chat { conversation } => {
            commands::chat::run(conversation).await?;
        }
        Commands::Send {
            message,
            conversation,
        } => {
            commands::chat::send(message, conversation).await?;
        }
        Commands::Capabilities { command } => match command {
            CapabilitiesCommands::List {
                conversation,
                group,
            } => {
                commands::capabilities::list(conversation, group).await?;
            }
            CapabilitiesCommands::Run { name, params } => {
                commands::capabilities::run(&name, params).await?;
            }
        },
        Commands::Profiles { command } => match command {
            ProfilesCommands::List => {
                commands::profiles::list().await?;
            }
        },
    }

    Ok(())
}
