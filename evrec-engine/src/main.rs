use anyhow::Result;
use clap::Parser;
use evrec_engine::config::CliArgs;
use evrec_engine::server::EngineServer;
use evrec_engine::service::RecommendationService;
use evrec_engine::transport::NdjsonTransport;

#[tokio::main]
async fn main() -> Result<()> {
	let args = CliArgs::parse();

	// Logging goes to stderr; stdout carries the JSON-RPC stream
	tracing_subscriber::fmt()
		.with_writer(std::io::stderr)
		.with_env_filter(
			tracing_subscriber::EnvFilter::try_from_default_env()
				.unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&args.log_level)),
		)
		.init();

	let config = args.into_service_config()?;
	let service = RecommendationService::start(config).await?;
	let mut server = EngineServer::new(NdjsonTransport::new(), service);

	tracing::info!("evrec-engine ready");

	let served = tokio::select! {
		result = server.run() => result,
		_ = tokio::signal::ctrl_c() => {
			tracing::info!("Interrupted");
			Ok(())
		}
	};
	if let Err(e) = &served {
		tracing::error!("Server error: {}", e);
	}

	server.into_service().shutdown().await?;
	served?;
	Ok(())
}
