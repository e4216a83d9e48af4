use std::sync::Arc;

use affinity_engine::config::{CliArgs, EngineConfig};
use affinity_engine::engine::AffinityEngine;
use affinity_engine::providers::{MemoryBookmarks, MemoryEmbeddings};
use affinity_engine::server::AffinityServer;
use affinity_engine::transport::NdjsonTransport;
use anyhow::Result;
use clap::Parser;

#[tokio::main]
async fn main() -> Result<()> {
	let args = CliArgs::parse();

	// Logs go to stderr; stdout carries JSON-RPC only
	tracing_subscriber::fmt()
		.with_writer(std::io::stderr)
		.with_env_filter(
			tracing_subscriber::EnvFilter::try_from_default_env()
				.unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&args.log_level)),
		)
		.init();

	let config = EngineConfig::try_from(args)?;
	let embeddings = Arc::new(MemoryEmbeddings::new(config.dimension));
	let bookmarks = Arc::new(MemoryBookmarks::new());
	let engine = AffinityEngine::start(config, embeddings.clone(), bookmarks.clone())?;

	let server = AffinityServer::new(NdjsonTransport::new(), engine, embeddings, bookmarks);
	server.load()?;

	tracing::info!("affinity-engine ready");
	let result = server.run().await;
	server.shutdown().await;
	result?;
	Ok(())
}
