use std::time::Instant;

use once_cell::sync::Lazy;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, Registry, reload};

pub static APPLICATION_START_TIME: Lazy<Instant> = Lazy::new(Instant::now);

static LOG_HANDLE: once_cell::sync::OnceCell<LogHandle> = once_cell::sync::OnceCell::new();

type LogHandle = reload::Handle<EnvFilter, Registry>;

/// Installs the global tracing subscriber. The filter follows RUST_LOG and can
/// be swapped at runtime through [`set_level`].
pub fn setup_logging() {
	Lazy::force(&APPLICATION_START_TIME);
	let filter = default_filter();
	let (filter, handle) = reload::Layer::new(filter);
	let fmt = tracing_subscriber::fmt::layer()
		.with_target(true)
		.with_writer(std::io::stderr);
	tracing_subscriber::registry().with(filter).with(fmt).init();
	let _ = LOG_HANDLE.set(handle);
}

fn default_filter() -> EnvFilter {
	EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Replaces the active log filter, e.g. from an admin endpoint. An empty
/// string resets to the startup filter.
pub fn set_level(directive: &str) -> anyhow::Result<()> {
	let Some(handle) = LOG_HANDLE.get() else {
		anyhow::bail!("logging not initialized");
	};
	let new = if directive.is_empty() {
		default_filter()
	} else {
		directive.parse()?
	};
	handle.reload(new)?;
	Ok(())
}

/// Installs a plain subscriber for tests; safe to call repeatedly.
pub fn testing_logging() {
	let _ = tracing_subscriber::fmt()
		.with_env_filter(default_filter())
		.with_test_writer()
		.try_init();
}
