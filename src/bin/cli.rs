//! CLI for cluster inspection

use chronodb::common::format_millis;
use clap::{Parser, Subcommand};
use serde_json::Value;

#[derive(Parser)]
#[command(name = "chronodb")]
#[command(about = "chronodb cluster inspection CLI")]
#[command(version)]
struct Cli {
    /// Status API of any node
    #[arg(long, default_value = "http://localhost:8086")]
    node: String,

    /// Print raw JSON
    #[arg(long)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Node and consensus status
    Status,

    /// List cluster servers
    Servers,

    /// List shards and their owners
    Shards,
}

async fn fetch(base: &str, path: &str) -> anyhow::Result<Value> {
    let url = format!("{}{}", base.trim_end_matches('/'), path);
    let response = reqwest::get(&url).await?;
    if !response.status().is_success() {
        anyhow::bail!("{} returned {}", url, response.status());
    }
    Ok(response.json().await?)
}

fn field(value: &Value, name: &str) -> String {
    match value.get(name) {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Null) | None => "-".to_string(),
        Some(other) => other.to_string(),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Status => {
            let status = fetch(&cli.node, "/status").await?;
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&status)?);
                return Ok(());
            }
            println!("Node status:");
            println!("  Version: {}", field(&status, "version"));
            println!("  State: {}", field(&status, "state"));
            println!("  Server: {}", field(&status, "server_id"));
            println!("  Raft role: {}", field(&status, "raft_role"));
            println!("  Term: {}", field(&status, "term"));
            println!("  Leader: {}", field(&status, "leader"));
            println!("  Commit index: {}", field(&status, "commit_index"));
            println!("  Applied index: {}", field(&status, "applied_index"));
            println!(
                "  Shards: {} ({} local)",
                field(&status, "shards"),
                field(&status, "local_shards")
            );
        }

        Commands::Servers => {
            let servers = fetch(&cli.node, "/cluster/servers").await?;
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&servers)?);
                return Ok(());
            }
            println!("{:<6} {:<38} {:<9} {:<28} rpc", "id", "raft name", "role", "raft");
            for server in servers.as_array().into_iter().flatten() {
                let connection = server.get("connection").cloned().unwrap_or(Value::Null);
                println!(
                    "{:<6} {:<38} {:<9} {:<28} {}",
                    field(server, "id"),
                    field(server, "raft_name"),
                    field(server, "role"),
                    field(&connection, "raft_connection_string"),
                    field(&connection, "rpc_connection_string"),
                );
            }
        }

        Commands::Shards => {
            let shards = fetch(&cli.node, "/cluster/shards").await?;
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&shards)?);
                return Ok(());
            }
            println!("{:<6} {:<26} {:<26} {:<6} owners", "id", "start", "end", "local");
            for shard in shards.as_array().into_iter().flatten() {
                let start = shard.get("start_time").and_then(Value::as_i64).unwrap_or(0);
                let end = shard.get("end_time").and_then(Value::as_i64).unwrap_or(0);
                println!(
                    "{:<6} {:<26} {:<26} {:<6} {}",
                    field(shard, "id"),
                    format_millis(start),
                    format_millis(end),
                    field(shard, "local"),
                    field(shard, "owners"),
                );
            }
        }
    }

    Ok(())
}
