//! Command execution.

use crate::Target;
use bytes::Bytes;
use colored::Colorize;
use sfn_client::{Client, ClientConfig, ClientError, Credential};
use sfn_core::WorkflowConfig;
use sfn_protocol::ClientType;
use sfn_server::{Config, Processor};
use std::error::Error;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Function slot written by `init` and used by the default dev workflow.
pub const DEFAULT_FUNCTION: &str = "sfn-app";

/// Parses a data tag given as decimal or `0x`-prefixed hex.
pub fn parse_tag(s: &str) -> Result<u8, String> {
    let s = s.trim();
    let value = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u8::from_str_radix(hex, 16),
        None => s.parse::<u8>(),
    }
    .map_err(|e| format!("invalid tag '{}': {}", s, e))?;

    if value > 0x7F {
        return Err(format!("tag {:#04x} out of range (0x00-0x7f)", value));
    }
    Ok(value)
}

/// Writes a workflow template, refusing to overwrite an existing file.
pub fn init(name: &str, output: &Path, host: &str, port: u16) -> Result<String, Box<dyn Error>> {
    if output.exists() {
        return Err(format!("{} already exists", output.display()).into());
    }

    let workflow = WorkflowConfig::single(name, host, port, DEFAULT_FUNCTION);
    workflow.validate()?;
    std::fs::write(output, workflow.to_yaml()?)?;

    Ok(format!(
        "{} workflow {} in {}",
        "Created".green(),
        name.cyan(),
        output.display()
    ))
}

pub async fn serve(workflow_path: PathBuf) -> Result<String, Box<dyn Error>> {
    let config = load_config()?;
    let workflow = WorkflowConfig::from_file(&workflow_path)?;
    run_processor(workflow, config).await
}

pub async fn dev(
    workflow_path: Option<PathBuf>,
    port: u16,
    function: &str,
) -> Result<String, Box<dyn Error>> {
    let mut config = load_config()?;
    config.tls.dev_mode = true;

    let workflow = match workflow_path {
        Some(path) => WorkflowConfig::from_file(&path)?,
        None => WorkflowConfig::single("sfn-dev", "127.0.0.1", port, function),
    };
    eprintln!(
        "{}: dev mode uses a self-signed certificate, connect with --insecure",
        "Warning".yellow()
    );
    run_processor(workflow, config).await
}

fn load_config() -> Result<Config, Box<dyn Error>> {
    let mut config = Config::load()?;
    config.load_secrets()?;
    Ok(config)
}

async fn run_processor(workflow: WorkflowConfig, config: Config) -> Result<String, Box<dyn Error>> {
    let name = workflow.name.clone();
    let functions = workflow.function_names().join(" -> ");
    let processor = Arc::new(Processor::start(workflow, config).await?);

    eprintln!(
        "{} processor {} on {} [{}]",
        "Started".green(),
        name.cyan(),
        processor.local_addr()?,
        functions
    );
    eprintln!("{}", "Press Ctrl+C to stop...".dimmed());

    let shutdown = processor.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        eprintln!("\n{}", "Stopping processor...".dimmed());
        shutdown.shutdown();
    });

    processor.run().await?;
    Ok("Processor stopped.".dimmed().to_string())
}

/// Connects as a stream function and prints every observed data frame.
pub async fn run_function(
    target: &Target,
    name: &str,
    observe: Vec<u8>,
    upper: bool,
    reply_tag: Option<u8>,
) -> Result<String, Box<dyn Error>> {
    let config = client_config(target, name, ClientType::StreamFunction)?
        .with_observe_data_tags(observe);
    let client = Client::connect(&target.server, config).await.map_err(|e| {
        eprintln!("{}: {}", "Connection failed".red(), e);
        e
    })?;

    client.set_handler(move |tag, data| {
        println!("{}", format_data(tag, &data));
        if upper {
            Some((reply_tag.unwrap_or(tag), Bytes::from(data.to_ascii_uppercase())))
        } else {
            None
        }
    });

    eprintln!(
        "{} as {} to {}",
        "Connected".green(),
        name.cyan(),
        target.server
    );
    eprintln!("{}", "Press Ctrl+C to stop...".dimmed());

    tokio::select! {
        _ = client.wait_closed() => {
            return Err(format!("connection closed ({})", client.state()).into());
        }
        _ = tokio::signal::ctrl_c() => {}
    }

    client.close().await?;
    Ok("Disconnected.".dimmed().to_string())
}

pub fn client_config(
    target: &Target,
    name: &str,
    client_type: ClientType,
) -> Result<ClientConfig, ClientError> {
    let credential = match target.credential {
        Some(ref s) => s.parse::<Credential>()?,
        None => Credential::None,
    };
    Ok(ClientConfig::new(name, client_type)
        .with_app_id(target.app_id.as_str())
        .with_credential(credential)
        .with_tls(target.tls.clone()))
}

/// One line per data frame: tag then carriage (lossy UTF-8).
pub fn format_data(tag: u8, data: &[u8]) -> String {
    format!(
        "[{}] {}",
        format!("{:#04x}", tag).cyan(),
        String::from_utf8_lossy(data)
    )
}
