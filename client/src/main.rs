use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context as _;
use clap::{Parser, Subcommand};
use log::info;

use fabric_client::config::DelegationConfig;
use fabric_client::delegate::{delegate_task, DelegationRequest};
use fabric_client::inbox::save_pack;
use fabric_client::registry::RegistryClient;
use fabric_common::config::{DEFAULT_REQUEST_TIMEOUT_SECS, DEFAULT_TASK_TIMEOUT_SECS, VERSION};

#[derive(Debug, Parser)]
#[command(name = "fabric_client", version, about = "Fabric delegation client")]
struct Cli {
    /// Registry WebSocket URL
    #[clap(long, default_value = "ws://127.0.0.1:18999", global = true)]
    registry_url: String,
    /// Registry token
    #[clap(long, default_value = "", global = true)]
    registry_token: String,
    /// Payer identity used for preauth and per-client rate limits
    #[clap(long, default_value = "", global = true)]
    client_id: String,
    /// Log level (off, error, warn, info, debug, trace)
    #[clap(long, default_value = "warn", global = true)]
    log_level: log::LevelFilter,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run a task on the best available provider
    Delegate {
        /// Task kind (echo, llm.chat, agent)
        #[clap(long, default_value = "llm.chat")]
        kind: String,
        /// Prompt text
        #[clap(long)]
        prompt: String,
        /// Capability filter; defaults to the task kind
        #[clap(long)]
        capability: Option<String>,
        /// Pin a specific provider node id
        #[clap(long)]
        to_node: Option<String>,
        /// Service token forwarded to the node
        #[clap(long, default_value = "")]
        service_token: String,
        /// Relay WebSocket URL
        #[clap(long, default_value = "")]
        relay_url: String,
        /// Relay token
        #[clap(long, default_value = "")]
        relay_token: String,
        /// Never fall back to direct endpoints
        #[clap(long, default_value_t = false)]
        relay_only: bool,
        /// Disable points preauthorization
        #[clap(long, default_value_t = false)]
        no_preauth: bool,
        /// Fail when preauth credentials are missing
        #[clap(long, default_value_t = false)]
        preauth_required: bool,
        /// Skip providers above this price
        #[clap(long)]
        max_price_points: Option<u64>,
        /// Task read deadline (seconds)
        #[clap(long, default_value_t = DEFAULT_TASK_TIMEOUT_SECS)]
        timeout: u64,
    },
    /// List online nodes
    Nodes {
        /// Required capability filter (repeatable)
        #[clap(long = "capability")]
        capabilities: Vec<String>,
        #[clap(long)]
        page: Option<usize>,
        #[clap(long)]
        page_size: Option<usize>,
    },
    /// Show the points leaderboard
    Leaderboard {
        /// earnedPoints, balance or completedTasks
        #[clap(long)]
        sort_by: Option<String>,
        #[clap(long)]
        limit: Option<usize>,
    },
    /// List knowledge packs
    KnowledgeList {
        #[clap(long)]
        kind: Option<String>,
        #[clap(long)]
        tag: Option<String>,
        #[clap(long)]
        owner: Option<String>,
        #[clap(long)]
        limit: Option<usize>,
    },
    /// Fetch one knowledge pack
    KnowledgeGet {
        #[clap(long)]
        id: String,
        /// Save into the local inbox instead of printing the content
        #[clap(long, default_value_t = false)]
        save: bool,
        /// Inbox directory
        #[clap(long, default_value = "universe_inbox")]
        inbox_dir: String,
    },
    /// Publish a knowledge pack from a JSON file
    KnowledgePublish {
        /// Pack file with name/kind/content (plus optional id, summary,
        /// tags, version)
        #[clap(long)]
        file: PathBuf,
        /// Owner node id recorded on the pack
        #[clap(long, default_value = "")]
        owner_node: String,
        #[clap(long, default_value_t = false)]
        allow_update: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    fabric_common::logger::init(cli.log_level).context("logger init failed")?;
    info!("fabric client v{}", VERSION);

    let registry = RegistryClient::new(
        cli.registry_url.clone(),
        cli.registry_token.clone(),
        Duration::from_secs(DEFAULT_REQUEST_TIMEOUT_SECS),
    );

    match cli.command {
        Command::Delegate {
            kind,
            prompt,
            capability,
            to_node,
            service_token,
            relay_url,
            relay_token,
            relay_only,
            no_preauth,
            preauth_required,
            max_price_points,
            timeout,
        } => {
            let cfg = DelegationConfig {
                registry_url: cli.registry_url,
                registry_token: cli.registry_token,
                client_id: cli.client_id,
                service_token,
                relay_url,
                relay_token,
                relay_only,
                preauth_enabled: !no_preauth,
                preauth_required,
                max_price_points,
                task_timeout: Duration::from_secs(timeout),
                ..Default::default()
            };
            let outcome = delegate_task(
                &cfg,
                DelegationRequest {
                    kind,
                    prompt,
                    require_capability: capability,
                    to_node,
                },
            )
            .await?;
            eprintln!(
                "node {} answered in {} ms",
                outcome.node.node_id, outcome.latency_ms
            );
            println!("{}", outcome.content);
        }
        Command::Nodes {
            capabilities,
            page,
            page_size,
        } => {
            let result = registry
                .list_nodes(&capabilities, true, page, page_size)
                .await?;
            eprintln!(
                "{} nodes (page {}/{} by {})",
                result.total,
                result.page,
                result.total.div_ceil(result.page_size.max(1)).max(1),
                result.page_size
            );
            for node in result.nodes {
                println!(
                    "{}\t{}\t{}pt\tok={} fail={}\t{}ms",
                    node.node_id,
                    if node.node_name.is_empty() { "-" } else { &node.node_name },
                    node.price_points,
                    node.success_count,
                    node.fail_count,
                    node.avg_latency_ms,
                );
            }
        }
        Command::Leaderboard { sort_by, limit } => {
            let board = registry.leaderboard(sort_by.as_deref(), limit).await?;
            eprintln!("sorted by {}", board.sort_by);
            for (rank, node) in board.nodes.iter().enumerate() {
                println!(
                    "{}\t{}\tearned={} balance={} completed={}",
                    rank + 1,
                    node.node_id,
                    node.earned_points,
                    node.balance,
                    node.completed_tasks,
                );
            }
        }
        Command::KnowledgeList {
            kind,
            tag,
            owner,
            limit,
        } => {
            let packs = registry
                .knowledge_list(kind.as_deref(), tag.as_deref(), owner.as_deref(), limit)
                .await?;
            for pack in packs {
                println!(
                    "{}\t{}\t{}\tv{}\t{}B\t{}",
                    pack.id, pack.name, pack.kind, pack.version, pack.size_bytes, pack.owner_node,
                );
            }
        }
        Command::KnowledgeGet {
            id,
            save,
            inbox_dir,
        } => {
            let pack = registry.knowledge_get(&id).await?;
            if save {
                let path = save_pack(&PathBuf::from(inbox_dir), &pack)?;
                eprintln!("saved {} to {}", pack.id, path.display());
            } else {
                println!("{}", pack.content);
            }
        }
        Command::KnowledgePublish {
            file,
            owner_node,
            allow_update,
        } => {
            let data = std::fs::read_to_string(&file)
                .with_context(|| format!("cannot read {}", file.display()))?;
            let value: serde_json::Value = serde_json::from_str(&data)?;
            let name = value.get("name").and_then(|v| v.as_str()).unwrap_or("");
            let kind = value.get("kind").and_then(|v| v.as_str()).unwrap_or("");
            let content = value.get("content").and_then(|v| v.as_str()).unwrap_or("");
            let tags: Vec<String> = value
                .get("tags")
                .and_then(|v| v.as_array())
                .map(|tags| {
                    tags.iter()
                        .filter_map(|t| t.as_str())
                        .map(str::to_string)
                        .collect()
                })
                .unwrap_or_default();
            let ok = registry
                .knowledge_publish(
                    value.get("id").and_then(|v| v.as_str()),
                    name,
                    kind,
                    content,
                    value.get("summary").and_then(|v| v.as_str()).unwrap_or(""),
                    &tags,
                    value.get("version").and_then(|v| v.as_str()).unwrap_or("1.0"),
                    &owner_node,
                    allow_update,
                )
                .await?;
            eprintln!(
                "published {} ({} bytes, hash {})",
                ok.id, ok.size_bytes, ok.content_hash
            );
        }
    }
    Ok(())
}
