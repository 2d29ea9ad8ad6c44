//! Interactive source.

use crate::commands::{client_config, parse_tag};
use crate::Target;
use colored::Colorize;
use rustyline::error::ReadlineError;
use rustyline::history::DefaultHistory;
use rustyline::{Config, Editor};
use sfn_client::Client;
use sfn_protocol::ClientType;

const HELP_TEXT: &str = r#"
Every line is sent as one data frame under the current tag.

Available commands:
  :help                 Show this help
  :tag [tag]            Show or change the data tag (decimal or 0x hex)
  :quit, :exit          Exit the source
"#;

/// What the REPL does with one input line.
#[derive(Debug, PartialEq, Eq)]
enum Input<'a> {
    Help,
    Quit,
    ShowTag,
    SetTag(u8),
    Send(&'a str),
    Invalid(String),
}

fn parse_input(line: &str) -> Input<'_> {
    let Some(command) = line.strip_prefix(':') else {
        return Input::Send(line);
    };

    let mut parts = command.split_whitespace();
    match (parts.next(), parts.next()) {
        (Some("help") | Some("?"), _) => Input::Help,
        (Some("quit") | Some("exit") | Some("q"), _) => Input::Quit,
        (Some("tag"), None) => Input::ShowTag,
        (Some("tag"), Some(tag)) => match parse_tag(tag) {
            Ok(tag) => Input::SetTag(tag),
            Err(e) => Input::Invalid(e),
        },
        _ => Input::Invalid(format!(
            "Unknown command: {}. Type ':help' for help.",
            line
        )),
    }
}

pub async fn run(
    target: &Target,
    name: &str,
    mut tag: u8,
) -> Result<String, Box<dyn std::error::Error>> {
    println!("{}", "sfn source".bold().cyan());
    println!("Connecting to {}...", target.server);

    let config = client_config(target, name, ClientType::Source)?;
    let client = Client::connect(&target.server, config).await?;
    println!("{}", "Connected!".green());

    // Create readline editor
    let config = Config::builder()
        .history_ignore_space(true)
        .auto_add_history(true)
        .build();
    let mut rl: Editor<(), DefaultHistory> = Editor::with_config(config)?;

    let history_path = std::env::var("HOME")
        .map(|h| std::path::PathBuf::from(h).join(".sfn_history"))
        .unwrap_or_else(|_| ".sfn_history".into());
    let _ = rl.load_history(&history_path);

    println!("Type ':help' for available commands.\n");

    loop {
        let prompt = format!("{} ", format!("sfn[{:#04x}]>", tag).cyan());
        match rl.readline(&prompt) {
            Ok(line) => {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }

                match parse_input(line) {
                    Input::Help => println!("{}", HELP_TEXT),
                    Input::Quit => break,
                    Input::ShowTag => println!("{:#04x}\n", tag),
                    Input::SetTag(new_tag) => {
                        tag = new_tag;
                        println!("{} {:#04x}\n", "Tag".green(), tag);
                    }
                    Input::Invalid(message) => println!("{}\n", message),
                    Input::Send(data) => {
                        if let Err(e) = client.write_data(tag, data.to_string()).await {
                            println!("{}: {}\n", "Error".red(), e);
                            if !client.is_connected() {
                                break;
                            }
                        }
                    }
                }
            }
            Err(ReadlineError::Interrupted) => {
                println!("^C");
                continue;
            }
            Err(ReadlineError::Eof) => {
                println!("^D");
                break;
            }
            Err(err) => {
                println!("{}: {:?}", "Error".red(), err);
                break;
            }
        }
    }

    let _ = rl.save_history(&history_path);

    let _ = client.close().await;
    Ok("Disconnected.".dimmed().to_string())
}
