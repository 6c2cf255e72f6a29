use std::{net::SocketAddr, path::PathBuf, sync::Arc, time::Duration};

use clap::Args;
use color_eyre::{Result, eyre::eyre};
use tower_http::trace::TraceLayer;
use tracing::info;

use super::{
	confirmations::ConfirmationStore,
	executor::ProcessExecutor,
	handler::{WebhookState, webhook_router},
};

#[derive(Args, Clone, Debug)]
pub struct ServeArgs {
	/// Port to listen on
	#[arg(long, env = "PORT", default_value_t = 3000)]
	pub port: u16,

	/// Address to bind to
	#[arg(long, default_value = "0.0.0.0")]
	pub host: String,

	/// Wall-clock limit for one automation run, in seconds
	#[arg(long, default_value_t = 300)]
	pub timeout_secs: u64,

	/// How long a messaging confirmation stays valid, in seconds
	#[arg(long, default_value_t = 1800)]
	pub confirmation_ttl_secs: u64,
}

impl ServeArgs {
	pub fn socket_addr(&self) -> Result<SocketAddr> {
		format!("{}:{}", self.host, self.port).parse().map_err(|e| eyre!("Invalid listen address {}:{}: {}", self.host, self.port, e))
	}
}

/// Serve the webhook API until the process is stopped.
///
/// `run_args` go in front of the child's `run` subcommand.
pub async fn serve(args: ServeArgs, downloads_dir: PathBuf, run_args: Vec<String>) -> Result<()> {
	let addr = args.socket_addr()?;
	let executor = ProcessExecutor::current_exe(Duration::from_secs(args.timeout_secs), downloads_dir, run_args)?;
	let ttl = Duration::from_secs(args.confirmation_ttl_secs);
	let state = WebhookState::new(ConfirmationStore::new(ttl), executor);

	let confirmations = Arc::clone(&state.confirmations);
	tokio::spawn(async move {
		let mut tick = tokio::time::interval(Duration::from_secs(60));
		loop {
			tick.tick().await;
			let purged = confirmations.purge_expired().await;
			if purged > 0 {
				tracing::debug!(purged, "dropped expired confirmations");
			}
		}
	});

	let app = webhook_router(state).layer(TraceLayer::new_for_http());
	let listener = tokio::net::TcpListener::bind(addr).await.map_err(|e| eyre!("Failed to bind {}: {}", addr, e))?;

	info!("Hilan automation webhook server running on port {}", args.port);
	info!("Webhook URL: http://localhost:{}/webhook/hilan-automation", args.port);
	info!("WhatsApp confirmation: http://localhost:{}/webhook/whatsapp-confirmation", args.port);
	info!("Manual trigger: http://localhost:{}/trigger", args.port);

	axum::serve(listener, app).await.map_err(|e| eyre!("Server error: {}", e))?;
	Ok(())
}

#[cfg(test)]
mod tests {
	use clap::Parser;

	use super::*;

	#[derive(Parser)]
	struct Cli {
		#[command(flatten)]
		serve: ServeArgs,
	}

	#[test]
	fn defaults_match_documented_values() {
		let cli = Cli::try_parse_from(["serve", "--port", "8080"]).unwrap();
		assert_eq!(cli.serve.port, 8080);
		assert_eq!(cli.serve.timeout_secs, 300);
		assert_eq!(cli.serve.confirmation_ttl_secs, 1800);
		assert_eq!(cli.serve.socket_addr().unwrap(), "0.0.0.0:8080".parse().unwrap());
	}

	#[test]
	fn bad_host_is_an_error() {
		let cli = Cli::try_parse_from(["serve", "--port", "1", "--host", "not a host"]).unwrap();
		assert!(cli.serve.socket_addr().is_err());
	}
}
