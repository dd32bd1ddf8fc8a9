use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};

use anyhow::Result;
use clap::Parser;
use fabricproxy::admin;
use fabricproxy::config::Config;
use fabricproxy::telemetry;
use prometheus_client::registry::Registry;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
	/// Use config from bytes
	#[arg(short, long, value_name = "config")]
	config: Option<bytes::Bytes>,

	/// Use config from file
	#[arg(short, long, value_name = "file")]
	file: Option<PathBuf>,
}

fn load_config(args: Args) -> Result<Config> {
	match (args.file, args.config) {
		(Some(_), Some(_)) => anyhow::bail!("both --file and --config cannot be provided"),
		(Some(path), None) => {
			let raw = std::fs::read_to_string(&path)?;
			Ok(serde_yaml::from_str(&raw)?)
		},
		(None, Some(bytes)) => {
			let raw = std::str::from_utf8(&bytes)?;
			Ok(serde_yaml::from_str(raw)?)
		},
		(None, None) => Ok(Config::default()),
	}
}

#[tokio::main]
async fn main() -> Result<()> {
	tracing_subscriber::fmt()
		.with_env_filter(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
		.with_writer(std::io::stderr)
		.with_ansi(false)
		.init();

	let args = Args::parse();
	let config = load_config(args)?;

	// Registers the dispatcher/pool counters; an embedder wires the returned `Arc<Metrics>` into
	// its own dispatch call sites. This binary only needs the registry for `/metrics`.
	let mut registry = Registry::default();
	let _metrics = telemetry::Metrics::new(&mut registry);
	let metrics_app = telemetry::App::new(Arc::new(registry));

	let pools: Arc<admin::PoolRegistry> = Arc::new(RwLock::new(HashMap::new()));
	let admin_app = admin::App::new(pools.clone());

	let ready = agent_core::readiness::Ready::new();
	let (drain_trigger, drain_watcher) = agent_core::drain::new();

	let admin_listener = tokio::net::TcpListener::bind(&config.admin_addr).await?;
	let metrics_listener = tokio::net::TcpListener::bind(&config.metrics_addr).await?;
	info!(admin = %config.admin_addr, metrics = %config.metrics_addr, "listening");

	let admin_ready = ready.register_task("admin");
	let admin_watcher = drain_watcher.clone();
	let admin_task = tokio::spawn(async move {
		drop(admin_ready);
		axum::serve(admin_listener, admin_app.router())
			.with_graceful_shutdown(async move {
				let _guard = admin_watcher.wait_for_drain().await;
			})
			.await
	});

	let metrics_ready = ready.register_task("metrics");
	let metrics_watcher = drain_watcher.clone();
	let metrics_task = tokio::spawn(async move {
		drop(metrics_ready);
		axum::serve(metrics_listener, metrics_app.router())
			.with_graceful_shutdown(async move {
				let _guard = metrics_watcher.wait_for_drain().await;
			})
			.await
	});

	drop(drain_watcher);
	let shutdown = agent_core::signal::Shutdown::new();
	shutdown.wait().await;
	info!("shutdown signal received, draining");
	drain_trigger.start_drain_and_wait(agent_core::drain::DrainMode::Graceful).await;

	admin_task.await??;
	metrics_task.await??;
	Ok(())
}
