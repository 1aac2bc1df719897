use color_eyre::Result;
use futures::Future;
use tokio::task::JoinHandle;
use tracing::{Instrument, Level, Subscriber};
use tracing_error::ErrorLayer;
use tracing_subscriber::{fmt::format, layer::SubscriberExt, EnvFilter, FmtSubscriber};

pub fn spawn_in_span<F>(future: F) -> JoinHandle<F::Output>
where
	F: Future + Send + 'static,
	F::Output: Send + 'static,
{
	tokio::spawn(future.in_current_span())
}

fn env_filter(log_level: Level) -> EnvFilter {
	EnvFilter::new(format!("odf_light_core={log_level},warn"))
}

pub fn json_subscriber(log_level: Level) -> impl Subscriber + Send + Sync {
	FmtSubscriber::builder()
		.json()
		.with_env_filter(env_filter(log_level))
		.with_span_events(format::FmtSpan::CLOSE)
		.finish()
		.with(ErrorLayer::default())
}

pub fn default_subscriber(log_level: Level) -> impl Subscriber + Send + Sync {
	FmtSubscriber::builder()
		.with_env_filter(env_filter(log_level))
		.with_span_events(format::FmtSpan::CLOSE)
		.finish()
		.with(ErrorLayer::default())
}

/// Installs the global tracing subscriber in the configured format.
pub fn init_logging(log_level: Level, json: bool) -> Result<()> {
	if json {
		tracing::subscriber::set_global_default(json_subscriber(log_level))?;
	} else {
		tracing::subscriber::set_global_default(default_subscriber(log_level))?;
	};
	Ok(())
}
