//! sfn-cli - Command-line interface for sfn
//!
//! Runs processors, stream functions and an interactive source.

mod commands;
mod repl;

use clap::{Parser, Subcommand};
use colored::Colorize;
use sfn_client::TlsClientConfig;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "sfn-cli")]
#[command(about = "Command-line interface for the sfn stream-function processor")]
#[command(version)]
struct Cli {
    /// Processor address
    #[arg(short, long, default_value = "127.0.0.1:9000", env = "SFN_SERVER")]
    server: String,

    /// Handshake credential: none, app_key:<secret>, public_key:<hex seed>, private_key:<hex seed>
    #[arg(long, env = "SFN_CREDENTIAL")]
    credential: Option<String>,

    /// Application id sent in the handshake
    #[arg(long, env = "SFN_APP_ID", default_value = "")]
    app_id: String,

    // ===== TLS Options =====
    /// Path to CA certificate for server verification
    #[arg(long, env = "SFN_TLS_CA")]
    ca_cert: Option<PathBuf>,

    /// Skip server certificate verification (INSECURE)
    #[arg(long, short = 'k')]
    insecure: bool,

    /// Server name for TLS SNI (defaults to server hostname)
    #[arg(long)]
    server_name: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
pub(crate) enum Commands {
    /// Write a workflow template
    Init {
        /// Processor name
        name: String,

        /// Output file
        #[arg(short, long, default_value = "workflow.yaml")]
        output: PathBuf,

        /// Listen host
        #[arg(long, default_value = "localhost")]
        host: String,

        /// Listen port
        #[arg(long, default_value_t = sfn_protocol::DEFAULT_PORT)]
        port: u16,
    },

    /// Run a processor from a workflow file
    Serve {
        /// Workflow file
        #[arg(short, long, env = "SFN_WORKFLOW")]
        config: PathBuf,
    },

    /// Run a processor with a generated dev certificate
    Dev {
        /// Workflow file (defaults to a single-function workflow)
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Listen port for the default workflow
        #[arg(long, default_value_t = sfn_protocol::DEFAULT_PORT)]
        port: u16,

        /// Function name for the default workflow
        #[arg(short = 'n', long, default_value = commands::DEFAULT_FUNCTION)]
        function: String,
    },

    /// Connect as a stream function and print observed data
    Run {
        /// Function name (must match the workflow)
        #[arg(short, long)]
        name: String,

        /// Observed data tags, comma separated (empty observes all)
        #[arg(short, long, value_delimiter = ',', value_parser = commands::parse_tag)]
        observe: Vec<u8>,

        /// Reply with the upper-cased carriage
        #[arg(long)]
        upper: bool,

        /// Tag for replies (defaults to the received tag)
        #[arg(long, value_parser = commands::parse_tag)]
        reply_tag: Option<u8>,
    },

    /// Interactive source sending each line as a data frame
    Source {
        /// Data tag for sent lines
        #[arg(short, long, value_parser = commands::parse_tag, default_value = "0x33")]
        tag: u8,

        /// Source name
        #[arg(short, long, default_value = "sfn-source")]
        name: String,
    },

    /// Generate SHA-256 hash of an app secret for config files
    HashSecret {
        /// The secret to hash
        secret: String,
    },

    /// Print version
    Version,
}

/// Connection options shared by `run` and `source`.
pub(crate) struct Target {
    pub server: String,
    pub credential: Option<String>,
    pub app_id: String,
    pub tls: TlsClientConfig,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .init();

    let cli = Cli::parse();

    let mut tls = TlsClientConfig::new();
    if let Some(ref path) = cli.ca_cert {
        tls = tls.with_ca_cert(path);
    }
    if cli.insecure {
        tls = tls.with_insecure();
    }
    if let Some(ref name) = cli.server_name {
        tls = tls.with_server_name(name);
    }
    let target = Target {
        server: cli.server,
        credential: cli.credential,
        app_id: cli.app_id,
        tls,
    };

    let result = match cli.command {
        Commands::Init {
            name,
            output,
            host,
            port,
        } => commands::init(&name, &output, &host, port),
        Commands::Serve { config } => commands::serve(config).await,
        Commands::Dev {
            config,
            port,
            function,
        } => commands::dev(config, port, &function).await,
        Commands::Run {
            name,
            observe,
            upper,
            reply_tag,
        } => commands::run_function(&target, &name, observe, upper, reply_tag).await,
        Commands::Source { tag, name } => repl::run(&target, &name, tag).await,
        Commands::HashSecret { secret } => Ok(sfn_server::auth::hash_secret(secret.as_bytes())),
        Commands::Version => Ok(format!("sfn-cli {}", env!("CARGO_PKG_VERSION"))),
    };

    match result {
        Ok(output) => {
            if !output.is_empty() {
                println!("{}", output);
            }
        }
        Err(e) => {
            eprintln!("{}: {}", "Error".red(), e);
            std::process::exit(1);
        }
    }

    Ok(())
}
