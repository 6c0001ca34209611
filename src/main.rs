use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use mcp_toolhub::function_def::{render_result, ToolDescription};
use mcp_toolhub::{Config, MCPClientManager};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "mcp-toolhub", version, about = "Query and call tools across MCP servers")]
struct Cli {
    /// Config file with an `mcpServers` map
    #[arg(short, long, env = "MCP_TOOLHUB_CONFIG", default_value = "mcp.json")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Print the combined tool catalog
    List {
        /// Print function definitions as JSON instead of a table
        #[arg(long)]
        json: bool,
    },
    /// Invoke a tool and print its result
    Call {
        tool: String,
        /// Arguments as a JSON object
        #[arg(long, default_value = "{}")]
        args: String,
        /// Send the call to this server instead of the catalog owner
        #[arg(long)]
        server: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = Config::load_config(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;

    let mut manager = MCPClientManager::new();
    manager
        .initialize(&config.servers())
        .await
        .context("no MCP server could be started")?;

    let outcome = run(&manager, cli.command).await;
    for (server, err) in manager.close().await {
        eprintln!("warning: closing {server}: {err}");
    }
    outcome
}

async fn run(manager: &MCPClientManager, command: Command) -> Result<()> {
    match command {
        Command::List { json } => {
            let tools = manager.get_all_tools().await;
            if json {
                let defs: Vec<_> = tools
                    .iter()
                    .map(|t| ToolDescription::from(t).to_function_definition())
                    .collect();
                println!("{}", serde_json::to_string_pretty(&defs)?);
                return Ok(());
            }
            for tool in &tools {
                let owner = manager.tool_owner(&tool.name).await.unwrap_or_default();
                println!(
                    "{:<32} {:<16} {}",
                    tool.name,
                    owner,
                    tool.description.as_deref().unwrap_or("")
                );
            }
            Ok(())
        }
        Command::Call { tool, args, server } => {
            let arguments: serde_json::Value =
                serde_json::from_str(&args).context("--args must be valid JSON")?;
            let result = match server {
                Some(server) => manager.call_tool_on(&server, &tool, arguments).await,
                None => manager.call_tool(&tool, arguments).await,
            };
            println!("{}", render_result(&result));
            if result.is_error {
                bail!("tool '{tool}' returned an error");
            }
            Ok(())
        }
    }
}
