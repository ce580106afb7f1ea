//! switchboard: ask the assistant backend from the command line

use std::io::{self, IsTerminal, Read, Write};
use std::path::PathBuf;

use clap::{Parser, Subcommand};
use futures_util::StreamExt;
use switchboard::{Assistant, Category, Config, TaskType};

/// Switchboard CLI
#[derive(Parser)]
#[command(name = "switchboard")]
#[command(version)]
#[command(about = "Provider routing and response cache for an assistant backend")]
struct Args {
    /// Config file (default: ~/.switchboard/config.toml, then /etc/switchboard/config.toml)
    #[arg(short, long, env = "SWITCHBOARD_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Ask a question; sentences are printed as they arrive
    Ask {
        /// Prompt (or omit to read from stdin)
        prompt: Option<String>,
        /// Task type: fast, complex, code or default
        #[arg(short, long, default_value = "default")]
        task: TaskType,
        /// Cache category: weather, news, static-knowledge, conversational or general
        #[arg(short = 'C', long, default_value = "general")]
        category: Category,
    },

    /// Probe every configured provider
    Probe,

    /// Print the metrics snapshot as JSON
    Metrics,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(io::stderr)
        .init();

    let args = Args::parse();
    let config = Config::load(args.config.as_deref())?;
    let assistant = Assistant::from_config(config)?;

    match args.command {
        Command::Ask {
            prompt,
            task,
            category,
        } => {
            let prompt = match prompt {
                Some(p) => p,
                None => read_stdin()?,
            };
            let mut response = assistant.ask(&prompt, task, category).await?;
            let origin = if response.cache_hit {
                "cache"
            } else if response.stale {
                "stale cache"
            } else if response.fallback {
                "fallback"
            } else {
                "provider"
            };

            let mut stdout = io::stdout().lock();
            while let Some(sentence) = response.next().await {
                writeln!(stdout, "{}", sentence?)?;
                stdout.flush()?;
            }
            eprintln!("[answered from {origin}]");
        }
        Command::Probe => {
            for outcome in assistant.probe_providers().await {
                match outcome.error {
                    None => println!("{}: ok", outcome.provider),
                    Some(e) => println!("{}: unhealthy ({e})", outcome.provider),
                }
            }
        }
        Command::Metrics => {
            println!("{}", serde_json::to_string_pretty(&assistant.metrics())?);
        }
    }

    Ok(())
}

fn read_stdin() -> io::Result<String> {
    if io::stdin().is_terminal() {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "no prompt given and stdin is a terminal",
        ));
    }
    let mut buf = String::new();
    io::stdin().read_to_string(&mut buf)?;
    Ok(buf.trim().to_string())
}
