//! Asset server of the web console
//!
//! Serves the console's single-page applications in HTML5 mode under a context root,
//! along with the generated `config.js` document describing the cluster.
#![warn(
	// Restriction
	missing_copy_implementations,
	missing_debug_implementations,
	missing_docs,
	unreachable_pub,
	unused,
	unused_crate_dependencies,
	unused_lifetimes,
	clippy::dbg_macro,
	clippy::empty_structs_with_brackets,
	clippy::enum_glob_use,
	clippy::float_cmp_const,
	clippy::format_push_string,
	clippy::match_on_vec_items,
	clippy::mem_forget,
	clippy::missing_docs_in_private_items,
	clippy::mod_module_files,
	clippy::option_option,
	clippy::rest_pat_in_fully_bound_structs,
	clippy::str_to_string,
	clippy::verbose_file_reads,
	// Suspicious
	noop_method_call,
	meta_variable_misuse,
	// Pedantic
	unused_qualifications,
	clippy::doc_link_with_quotes,
	clippy::doc_markdown,
	clippy::filter_map_next,
	clippy::float_cmp,
	clippy::inefficient_to_string,
	clippy::macro_use_imports,
	clippy::manual_let_else,
	clippy::match_wildcard_for_single_variants,
	clippy::missing_errors_doc,
	clippy::missing_panics_doc,
	clippy::needless_continue,
	clippy::semicolon_if_nothing_returned,
	clippy::unnested_or_patterns,
	clippy::unused_self,
	// Style
	unused_import_braces,
	// Nursery
	clippy::empty_line_after_outer_attr,
	clippy::imprecise_flops,
	clippy::missing_const_for_fn,
	clippy::suboptimal_flops,
)]
#![deny(
	// Restriction
	keyword_idents,
	non_ascii_idents,
	missing_abi,
	unsafe_op_in_unsafe_fn,
	unused_must_use,
	clippy::exit,
	clippy::lossy_float_literal,
)]
#![forbid(unsafe_code, clippy::undocumented_unsafe_blocks)]

use clap::Parser;
use std::{error::Error, net::SocketAddr, path::PathBuf, sync::Arc};
use time::format_description::well_known::{
	iso8601::{Config, EncodedConfig, TimePrecision},
	Iso8601,
};

mod assets;
mod config;
mod error;
mod http;
mod oauth;

/// Version of the console
const VERSION: &str = env!("CARGO_PKG_VERSION");
/// Token versioning the `ETag`s of the assets
///
/// Set `WEBCONSOLE_BUILD_ID` at compile time to invalidate caches on every build.
const CACHE_TOKEN: &str = match option_env!("WEBCONSOLE_BUILD_ID") {
	Some(build_id) => build_id,
	None => VERSION,
};

/// Command line arguments
#[derive(Debug, Parser)]
#[command(version, about)]
struct Cli {
	/// Configuration file (TOML or YAML)
	///
	/// Defaults to `webconsole-config.{toml,yaml}` in the working directory, if any.
	#[arg(short, long)]
	config: Option<PathBuf>,
	/// Maximum level of the logs
	#[arg(short, long, default_value_t = log::LevelFilter::Info)]
	log_level: log::LevelFilter,
	/// Also send the logs to the syslog (unix only)
	#[arg(long)]
	syslog: bool,
}

/// Sets up the application's logger
///
/// The logger should output logs like:
/// ```log
/// 2023-08-19T14:01:10Z INFO [webconsole] Serving the console under /console/
/// ```
///
/// If `syslog` is set and the compilation target is `unix`, the logs will be output to the syslog as well.
///
/// Also the [panic hook](std::panic::set_hook) is set to output panic info through the logger.
fn setup_logger(level: log::LevelFilter, syslog: bool) -> Result<(), fern::InitError> {
	use colored::Colorize;
	use fern::{
		colors::{Color, ColoredLevelConfig},
		Dispatch,
	};
	use time::OffsetDateTime;

	/// Name of the application to be used in logs
	const APP_NAME: &str = "webconsole";
	/// [`log`] target used by panics
	const PANIC_TARGET: &str = "PANIC";
	/// Format of the timestamps
	const TIME_FORMAT: EncodedConfig = Config::DEFAULT
		.set_time_precision(TimePrecision::Second {
			decimal_digits: None,
		})
		.encode();

	let colors = ColoredLevelConfig::default()
		.trace(Color::Magenta)
		.debug(Color::Green)
		.info(Color::Cyan);

	let mut logger = Dispatch::new()
		.level(level)
		.level_for("hyper", log::LevelFilter::Info)
		.level_for("reqwest", log::LevelFilter::Info)
		.level_for("rustls", log::LevelFilter::Warn)
		.level_for("tracing::span", log::LevelFilter::Warn)
		.chain(
			Dispatch::new()
				.format(move |out, message, record| {
					let Ok(timestamp) = OffsetDateTime::now_utc().format(&Iso8601::<TIME_FORMAT>) else { unreachable!() };
					let mut target = record.target();

					let message = message.to_string();
					let message = if target == PANIC_TARGET {
						message.bold().red()
					} else {
						message.normal()
					};

					if target == env!("CARGO_CRATE_NAME") || target == PANIC_TARGET {
						target = APP_NAME;
					}
					let target = target.dimmed();

					out.finish(format_args!(
						"{timestamp} {level:5} {pre_target}{target}{post_target} {message}",
						level = colors.color(record.level()),
						pre_target = "[".dimmed(),
						post_target = "]".dimmed(),
					));
				})
				.chain(std::io::stdout()),
		);
	#[cfg(unix)]
	{
		if syslog {
			let syslog_formatter = syslog::Formatter3164 {
				facility: syslog::Facility::LOG_DAEMON,
				hostname: None,
				process: APP_NAME.to_owned(),
				pid: 0,
			};
			logger = logger.chain(
				Dispatch::new().chain(syslog::unix(syslog_formatter).map_err(|err| match err.0 {
					syslog::ErrorKind::Io(err) => fern::InitError::Io(err),
					kind => fern::InitError::Io(std::io::Error::new(std::io::ErrorKind::Other, kind.to_string())),
				})?),
			);
		}
	}
	#[cfg(not(unix))]
	let _ = syslog;
	logger.apply()?;

	// Make panics use the installed logger
	std::panic::set_hook(Box::new(move |panic_info| {
		let thread = std::thread::current();
		let thread = thread.name().unwrap_or("<unnamed>");

		let message = match panic_info.payload().downcast_ref::<&str>() {
			Some(s) => *s,
			None => match panic_info.payload().downcast_ref::<String>() {
				Some(s) => s.as_str(),
				None => "of unknown reasons",
			},
		};

		if let Some(location) = panic_info.location() {
			log::error!(target: PANIC_TARGET, "Thread '{thread}' panicked at `{}:{}:{}` because {message}", location.file(), location.line(), location.column());
		} else {
			log::error!(target: PANIC_TARGET, "Thread '{thread}' panicked because {message}");
		}
	}));

	Ok(())
}

/// Builds the asset store described by `config`
///
/// Files of the configured assets directory take precedence over the embedded console.
fn build_assets(config: &config::Config) -> Result<assets::SharedAssets, error::Error> {
	let embedded: assets::SharedAssets = Arc::new(assets::Embedded);
	match &config.assets_dir {
		Some(dir) => {
			log::info!("Serving assets from {} over the embedded console", dir.display());
			let overlay: assets::SharedAssets = Arc::new(assets::Memory::from_dir(dir)?);
			Ok(Arc::new(assets::Layered::new(vec![overlay, embedded])))
		}
		None => Ok(embedded),
	}
}

/// Completes when the server should shut down
async fn shutdown_signal() {
	if let Err(err) = tokio::signal::ctrl_c().await {
		log::error!("Could not listen for the shutdown signal: {err}");
		std::future::pending::<()>().await;
	}
	log::info!("Shutting down");
}

/// Builds and runs the server until it is shut down
async fn run(cli: Cli) -> Result<(), error::Error> {
	let config = config::build_config(cli.config.as_deref())?;
	let master = config.master_url()?;
	let assets = build_assets(&config)?;
	let oauth = oauth::resolve(&config.oauth, &master).await?;

	let script = http::config_script::ConfigScript::new(&config, &master, &oauth, VERSION);
	let router = http::new_router(&config, assets, script, CACHE_TOKEN)?;

	let addr = config.serving_info.socket_addr();
	log::info!("Listening on {addr} (version {VERSION}, cache token {CACHE_TOKEN})");
	axum::Server::try_bind(&addr)?
		.serve(router.into_make_service_with_connect_info::<SocketAddr>())
		.with_graceful_shutdown(shutdown_signal())
		.await?;
	Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
	let cli = Cli::parse();
	setup_logger(cli.log_level, cli.syslog)?;

	if let Err(err) = run(cli).await {
		log::error!("{err}");
		return Err(err.into());
	}
	Ok(())
}
