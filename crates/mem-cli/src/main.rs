use std::path::PathBuf;

use anyhow::{Context, Result, anyhow};
use chrono::Utc;
use clap::{Parser, Subcommand};
use rusqlite::Connection;

use mem_core::{
    AddOptions, ConsolidateOptions, ContextMode, ContextOptions, ForgetFilter, Layer, ListOptions,
    Memory, MemoryType, Retriever, RuleOptions, SearchOptions, Store, UpdateRequest, UpsertOutcome,
};
use mem_embed::{EmbeddingQueue, JobOperation, RetryPolicy};

#[derive(Parser)]
#[command(name = "mem", about = "Local memory store CLI")]
struct Cli {
    /// Path to the SQLite file backing this memory store
    #[arg(long, global = true, default_value = "mem.db")]
    db: PathBuf,

    /// Enable verbose debug output
    #[arg(long, global = true)]
    verbose: bool,

    /// Print results as JSON instead of a human-readable summary
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create or upsert a memory
    Add {
        content: String,
        #[arg(long = "type")]
        memory_type: Option<String>,
        #[arg(long)]
        layer: Option<String>,
        #[arg(long)]
        project: Option<String>,
        #[arg(long)]
        category: Option<String>,
        #[arg(long, value_delimiter = ',')]
        tags: Vec<String>,
        #[arg(long)]
        upsert_key: Option<String>,
    },

    /// Fetch a single memory by id
    Get { id: String },

    /// Full-text search over active memories
    Search {
        query: String,
        #[arg(long)]
        layer: Option<String>,
        #[arg(long = "type")]
        memory_type: Option<String>,
        #[arg(long)]
        limit: Option<f64>,
    },

    /// List memories with filters, no text match
    List {
        #[arg(long)]
        layer: Option<String>,
        #[arg(long = "type")]
        memory_type: Option<String>,
        #[arg(long, value_delimiter = ',')]
        tags: Vec<String>,
        #[arg(long)]
        project: Option<String>,
        #[arg(long)]
        limit: Option<f64>,
    },

    /// List global-then-project rule memories
    Rules {
        #[arg(long)]
        project: Option<String>,
    },

    /// Soft-delete a memory by id
    Forget { id: String },

    /// Assemble rules + retrieved memories for the current turn
    Context {
        #[arg(long)]
        query: Option<String>,
        #[arg(long)]
        project: Option<String>,
        #[arg(long)]
        mode: Option<String>,
        #[arg(long)]
        limit: Option<f64>,
    },

    /// Merge duplicate memories sharing an upsert key
    Consolidate {
        #[arg(long)]
        project: Option<String>,
        #[arg(long)]
        dry_run: bool,
    },

    /// Permanently delete soft-deleted memories
    Vacuum,
}

fn init_tracing(verbose: bool) {
    use tracing_subscriber::EnvFilter;

    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::from_default_env().add_directive(tracing::Level::WARN.into())
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .init();
}

fn open_store(cli: &Cli) -> Result<Connection> {
    if let Some(parent) = cli.db.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent).ok();
    }
    let conn = Connection::open(&cli.db).with_context(|| format!("failed to open {}", cli.db.display()))?;
    mem_core::schema::ensure(&conn).context("failed to ensure mem-core schema")?;
    mem_embed::schema::ensure(&conn).context("failed to ensure mem-embed schema")?;
    Ok(conn)
}

fn parse_type(s: Option<&str>) -> Result<Option<MemoryType>> {
    s.map(MemoryType::parse).transpose().map_err(|e| anyhow!(e))
}

fn parse_layer(s: Option<&str>) -> Result<Option<Layer>> {
    s.map(Layer::parse).transpose().map_err(|e| anyhow!(e))
}

/// §4.2 "Embedding enqueue ... failure is logged, never surfaced to
/// callers" — the CLI write paths enqueue the same way the MCP tool
/// handlers do, so a memory written locally gets embedded whenever a
/// worker next drains the queue.
fn enqueue_embedding(conn: &Connection, memory: &Memory, operation: JobOperation) {
    let queue = EmbeddingQueue::new(conn, RetryPolicy::default());
    if let Err(e) = queue.enqueue(&memory.id, &memory.content, "text-embedding-3-small", operation, None, None, Utc::now()) {
        tracing::warn!(memory_id = %memory.id, error = %e, "embedding enqueue failed");
    }
}

fn print_memory(m: &Memory, json: bool) {
    if json {
        println!("{}", serde_json::to_string_pretty(m).unwrap_or_default());
    } else {
        println!(
            "{}  [{}/{}] {}",
            m.id,
            m.memory_type.as_str(),
            m.layer.as_str(),
            m.content.lines().next().unwrap_or("")
        );
    }
}

fn print_memories(memories: &[Memory], json: bool) {
    if json {
        println!("{}", serde_json::to_string_pretty(memories).unwrap_or_default());
        return;
    }
    if memories.is_empty() {
        println!("(no memories)");
        return;
    }
    for m in memories {
        print_memory(m, false);
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let conn = open_store(&cli)?;
    let now = Utc::now();

    match &cli.command {
        Commands::Add { content, memory_type, layer, project, category, tags, upsert_key } => {
            let opts = AddOptions {
                memory_type: parse_type(memory_type.as_deref())?,
                layer: parse_layer(layer.as_deref())?,
                scope: project.as_ref().map(|_| mem_core::Scope::Project),
                project_id: project.clone(),
                user_id: None,
                tags: tags.clone(),
                paths: Vec::new(),
                category: category.clone(),
                metadata: None,
                source_session_id: None,
                confidence: None,
                last_confirmed_at: None,
                upsert_key: upsert_key.clone(),
                expires_at: None,
            };
            let store = Store::new(&conn);
            let (memory, outcome) = store.add(content, opts, 24.0, now)?;
            let operation = match outcome {
                UpsertOutcome::Inserted => JobOperation::Add,
                UpsertOutcome::Updated => JobOperation::Edit,
            };
            enqueue_embedding(&conn, &memory, operation);
            if cli.json {
                print_memory(&memory, true);
            } else {
                println!("{} memory {}", if outcome == UpsertOutcome::Inserted { "added" } else { "updated" }, memory.id);
            }
        }

        Commands::Get { id } => {
            let store = Store::new(&conn);
            match store.get_by_id(id, None, now)? {
                Some(memory) => print_memory(&memory, cli.json),
                None => println!("(no such memory '{id}')"),
            }
        }

        Commands::Search { query, layer, memory_type, limit } => {
            let store = Store::new(&conn);
            let results = store.search(
                query,
                SearchOptions {
                    scope_global: true,
                    scope_project: false,
                    project_id: None,
                    user_id: None,
                    layers: parse_layer(layer.as_deref())?.into_iter().collect(),
                    types: parse_type(memory_type.as_deref())?.into_iter().collect(),
                    limit: *limit,
                },
                now,
            )?;
            print_memories(&results.memories, cli.json);
        }

        Commands::List { layer, memory_type, tags, project, limit } => {
            let store = Store::new(&conn);
            let results = store.list(
                ListOptions {
                    scope_global: true,
                    scope_project: project.is_some(),
                    project_id: project.clone(),
                    user_id: None,
                    layers: parse_layer(layer.as_deref())?.into_iter().collect(),
                    types: parse_type(memory_type.as_deref())?.into_iter().collect(),
                    tags: tags.clone(),
                    limit: *limit,
                },
                now,
            )?;
            print_memories(&results, cli.json);
        }

        Commands::Rules { project } => {
            let store = Store::new(&conn);
            let rules = store.get_rules(RuleOptions { project_id: project.clone(), user_id: None }, now)?;
            print_memories(&rules, cli.json);
        }

        Commands::Forget { id } => {
            let store = Store::new(&conn);
            let forgotten = store.forget(id, None, now)?;
            if cli.json {
                println!("{}", serde_json::json!({"id": id, "forgotten": forgotten}));
            } else if forgotten {
                println!("forgot {id}");
            } else {
                println!("(no such memory '{id}')");
            }
        }

        Commands::Context { query, project, mode, limit } => {
            let mode = match mode.as_deref() {
                Some("rules_only") => ContextMode::RulesOnly,
                Some(s) if !s.is_empty() && s != "all" => ContextMode::Layer(
                    Layer::parse(s).map_err(|e| anyhow!(e))?,
                ),
                _ => ContextMode::All,
            };
            let retriever = Retriever::new(&conn);
            let result = retriever.get_context(
                ContextOptions { query: query.clone(), project_id: project.clone(), user_id: None, limit: *limit, mode },
                now,
            )?;
            if cli.json {
                println!("{}", serde_json::json!({"rules": result.rules, "memories": result.memories}));
            } else {
                println!("-- rules --");
                print_memories(&result.rules, false);
                println!("-- memories --");
                print_memories(&result.memories, false);
            }
        }

        Commands::Consolidate { project, dry_run } => {
            let consolidator = mem_core::Consolidator::new(&conn);
            let result = consolidator.consolidate(
                ConsolidateOptions { project_id: project.clone(), include_global: true, global_only: false, types: Vec::new(), dry_run: *dry_run, model: None },
                now,
            )?;
            if cli.json {
                println!(
                    "{}",
                    serde_json::json!({
                        "run_id": result.run_id,
                        "input_count": result.input_count,
                        "merged_count": result.merged_count,
                        "superseded_ids": result.superseded_ids,
                        "winner_ids": result.winner_ids,
                        "conflicted_count": result.conflicted_count,
                    })
                );
            } else {
                println!(
                    "consolidated {} of {} candidates ({} conflicted){}",
                    result.merged_count,
                    result.input_count,
                    result.conflicted_count,
                    if *dry_run { " [dry run]" } else { "" }
                );
            }
        }

        Commands::Vacuum => {
            let store = Store::new(&conn);
            let removed = store.vacuum(None)?;
            if cli.json {
                println!("{}", serde_json::json!({"removed": removed}));
            } else {
                println!("vacuumed {removed} memories");
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_type_accepts_known_and_rejects_unknown() {
        assert!(parse_type(Some("rule")).unwrap() == Some(MemoryType::Rule));
        assert!(parse_type(None).unwrap().is_none());
        assert!(parse_type(Some("bogus")).is_err());
    }

    #[test]
    fn parse_layer_accepts_known_and_rejects_unknown() {
        assert!(parse_layer(Some("working")).unwrap() == Some(Layer::Working));
        assert!(parse_layer(Some("bogus")).is_err());
    }
}
