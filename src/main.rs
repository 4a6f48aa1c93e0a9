//! duokv command-line client.
//!
//! Opens the store described by a TOML config file, runs one operation and
//! prints the result as JSON on stdout. Logs go to stderr.

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use duokv::telemetry::{LogFormat, init_logging};
use duokv::{Entry, Pagination, Query, QueryFilter, QueryPage, Store, StoreConfig, TimeRange};
use serde_json::{Value, json};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(name = "duokv")]
#[command(about = "Key-value store over durable SQLite or an in-process cache")]
#[command(version)]
struct Cli {
    /// Store configuration file (defaults to a durable store under ./data)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Log output format
    #[arg(long, value_enum, default_value = "text", global = true)]
    log_format: LogFormatArg,

    #[command(subcommand)]
    command: Command,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum LogFormatArg {
    Text,
    Json,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print a record's value and metadata
    Get { key: String },
    /// Create or overwrite a record
    Set(WriteArgs),
    /// Replace the value of an existing record
    Update(WriteArgs),
    /// Create a record only if the key is free
    Insert(WriteArgs),
    /// Remove a record
    Delete { key: String },
    /// List records whose key matches a `*` pattern
    Query(QueryArgs),
}

#[derive(Args, Debug)]
struct WriteArgs {
    key: String,
    value: String,

    /// Expire the record after this many seconds
    #[arg(long)]
    ttl: Option<u64>,
}

impl WriteArgs {
    fn ttl(&self) -> Option<Duration> {
        self.ttl.map(Duration::from_secs)
    }
}

#[derive(Args, Debug)]
struct QueryArgs {
    pattern: String,

    /// Equality filter as a JSON object, e.g. '{"is_ttl_based": true}'
    #[arg(long)]
    filter: Option<String>,

    /// Pagination as a JSON object, e.g. '{"limit": 10, "offset": 20}'
    #[arg(long, conflicts_with_all = ["limit", "offset"])]
    page: Option<String>,

    #[arg(long)]
    limit: Option<u64>,

    #[arg(long)]
    offset: Option<u64>,

    /// Only records written at or after this RFC3339 time
    #[arg(long)]
    from: Option<String>,

    /// Only records written at or before this RFC3339 time
    #[arg(long)]
    to: Option<String>,
}

impl QueryArgs {
    fn build(&self) -> Result<Query> {
        let filter = match &self.filter {
            Some(raw) => QueryFilter::from_json(raw).context("Invalid --filter")?,
            None => QueryFilter::new(),
        };

        let page = match &self.page {
            Some(raw) => Pagination::from_json(raw).context("Invalid --page")?,
            None => {
                let mut page = Pagination::new();
                if let Some(limit) = self.limit {
                    page = page.limit(limit);
                }
                if let Some(offset) = self.offset {
                    page = page.offset(offset);
                }
                page
            },
        };

        let range = TimeRange::parse(self.from.as_deref(), self.to.as_deref())
            .context("Invalid time range")?;

        Ok(Query::new(&self.pattern)
            .with_filter(filter)
            .with_page(page)
            .with_range(range))
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let format = match cli.log_format {
        LogFormatArg::Text => LogFormat::Text,
        LogFormatArg::Json => LogFormat::Json,
    };
    init_logging(format, "warn");

    let config = match &cli.config {
        Some(path) => StoreConfig::load_from(path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?,
        None => StoreConfig {
            provider: "durable".to_string(),
            operation_timeout_ms: None,
            durable: None,
            cache: None,
        },
    };

    let store = Store::from_config(&config)
        .await
        .with_context(|| format!("Failed to open {} store", config.provider))?;

    let outcome = run(&store, cli.command).await;
    store.close().await.context("Failed to close store")?;

    println!("{}", serde_json::to_string_pretty(&outcome?)?);
    Ok(())
}

async fn run(store: &Store, command: Command) -> Result<Value> {
    Ok(match command {
        Command::Get { key } => {
            let entry = store
                .get(&key)
                .await
                .with_context(|| format!("Failed to get '{key}'"))?;
            entry_json(&key, &entry)
        },
        Command::Set(args) => {
            let result = match args.ttl() {
                Some(ttl) => store.set_with_ttl(&args.key, args.value.as_bytes(), ttl).await,
                None => store.set(&args.key, args.value.as_bytes()).await,
            };
            result.with_context(|| format!("Failed to set '{}'", args.key))?;
            json!({ "key": args.key, "status": "set" })
        },
        Command::Update(args) => {
            let result = match args.ttl() {
                Some(ttl) => {
                    store
                        .update_with_ttl(&args.key, args.value.as_bytes(), ttl)
                        .await
                },
                None => store.update(&args.key, args.value.as_bytes()).await,
            };
            result.with_context(|| format!("Failed to update '{}'", args.key))?;
            json!({ "key": args.key, "status": "updated" })
        },
        Command::Insert(args) => {
            let result = match args.ttl() {
                Some(ttl) => {
                    store
                        .insert_with_ttl(&args.key, args.value.as_bytes(), ttl)
                        .await
                },
                None => store.insert(&args.key, args.value.as_bytes()).await,
            };
            result.with_context(|| format!("Failed to insert '{}'", args.key))?;
            json!({ "key": args.key, "status": "inserted" })
        },
        Command::Delete { key } => {
            store
                .delete(&key)
                .await
                .with_context(|| format!("Failed to delete '{key}'"))?;
            json!({ "key": key, "status": "deleted" })
        },
        Command::Query(args) => {
            let query = args.build()?;
            let page = store
                .query(&query)
                .await
                .with_context(|| format!("Failed to query '{}'", args.pattern))?;
            page_json(&page)
        },
    })
}

/// Values are shown as text; non-UTF-8 bytes are replaced.
fn entry_json(key: &str, entry: &Entry) -> Value {
    let mut out = json!({
        "key": key,
        "value": String::from_utf8_lossy(&entry.value),
    });
    merge(&mut out, serde_json::to_value(&entry.metadata).unwrap_or_default());
    out
}

fn page_json(page: &QueryPage) -> Value {
    let items: Vec<Value> = page
        .items
        .iter()
        .map(|item| {
            let mut out = json!({
                "key": item.key,
                "data": String::from_utf8_lossy(&item.data),
            });
            merge(&mut out, serde_json::to_value(&item.metadata).unwrap_or_default());
            out
        })
        .collect();
    json!({ "items": items, "total": page.total })
}

fn merge(target: &mut Value, extra: Value) {
    if let (Value::Object(target), Value::Object(extra)) = (target, extra) {
        target.extend(extra);
    }
}
