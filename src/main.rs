mod chain;
mod config;
mod ledger;
mod replay;
mod sync;

use anyhow::{Context, Result};
use clap::Parser;
use serde::Serialize;
use std::path::Path;
use std::sync::Arc;
use tracing::info;

use crate::chain::JsonRpcClient;
use crate::config::{ChainArgs, Cli, Command, RetryPolicy, RunArgs, SyncSettings};
use crate::ledger::projection::{HistoryView, RecordView, TokenMetadata};
use crate::ledger::{FileRecordRepository, Owner, Pagination, RecordKey, StoreWriter};
use crate::sync::{DeadLetterQueue, FileWatermarkRepository, StateResolver, SyncCoordinator};

#[tokio::main]
async fn main() -> Result<()> {
	tracing_subscriber::fmt()
		.with_env_filter(
			tracing_subscriber::EnvFilter::from_default_env()
				.add_directive(tracing::Level::INFO.into()),
		)
		.with_target(false)
		.with_thread_ids(false)
		.with_thread_names(false)
		.with_file(false)
		.with_line_number(false)
		.with_timer(tracing_subscriber::fmt::time::time())
		.init();

	let cli = Cli::parse();
	let writer = open_store(&cli.data_dir).await?;

	match cli.command {
		Command::Run(args) => run(&cli.chain, &args, &cli.data_dir, writer).await,
		Command::Replay { key } => {
			let key = RecordKey::new(key)?;
			let client = Arc::new(connect(&cli.chain)?);
			let resolver =
				StateResolver::new(client, writer.clone(), cli.chain.contract(), RetryPolicy::default());
			let report = replay::repair_record(&resolver, &writer, &key)
				.await
				.with_context(|| format!("Failed to repair record {}", key))?;
			print_json(&report)
		}
		Command::Show { key } => {
			let key = RecordKey::new(key)?;
			let record = writer
				.get(&key)
				.await?
				.with_context(|| format!("Record {} not found", key))?;
			print_json(&serde_json::json!({
				"record": RecordView::from(&record),
				"metadata": TokenMetadata::from(&record),
			}))
		}
		Command::List { limit, skip, owner } => {
			let pagination = Pagination { limit, skip };
			let page = match owner {
				Some(owner) => writer.list_by_owner(&Owner::parse(owner)?, pagination).await?,
				None => writer.list(pagination).await?,
			};
			print_json(&page)
		}
		Command::History { key } => {
			let key = RecordKey::new(key)?;
			let history = writer.get_history(&key).await?;
			print_json(&history.iter().map(HistoryView::from).collect::<Vec<_>>())
		}
		Command::DeadLetters => {
			let letters = sync::dead_letter::read_dead_letters(&cli.data_dir).await?;
			print_json(&letters)
		}
	}
}

async fn run(chain: &ChainArgs, args: &RunArgs, data_dir: &Path, writer: Arc<StoreWriter>) -> Result<()> {
	let settings = SyncSettings::new(chain, args);
	info!(
		"Starting mood ledger sync for contract {} with {} shards",
		settings.contract, settings.shards
	);

	let client = Arc::new(connect(chain)?);
	let head = client
		.block_number()
		.await
		.with_context(|| format!("Node at {} is unreachable", chain.rpc_http_url))?;
	info!("Connected to node, head block {}", head);

	let watermarks = Arc::new(
		FileWatermarkRepository::open(data_dir)
			.await
			.context("Failed to open watermark store")?,
	);
	let dead_letters = Arc::new(
		DeadLetterQueue::open(data_dir)
			.await
			.context("Failed to open dead-letter log")?,
	);

	let handle = SyncCoordinator::start(client, writer, watermarks, dead_letters, settings)
		.await
		.context("Failed to start sync")?;

	tokio::signal::ctrl_c()
		.await
		.context("Failed to listen for shutdown signal")?;
	info!("Subscription states at shutdown: {:?}", handle.states());
	handle.shutdown().await;
	Ok(())
}

async fn open_store(data_dir: &Path) -> Result<Arc<StoreWriter>> {
	let repo = FileRecordRepository::open(data_dir)
		.await
		.with_context(|| format!("Failed to open record store in {:?}", data_dir))?;
	Ok(Arc::new(StoreWriter::new(Arc::new(repo))))
}

fn connect(chain: &ChainArgs) -> Result<JsonRpcClient> {
	JsonRpcClient::new(
		chain.rpc_http_url.clone(),
		chain.rpc_ws_url.clone(),
		chain.selectors(),
	)
	.context("Failed to build node client")
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
	println!("{}", serde_json::to_string_pretty(value)?);
	Ok(())
}
