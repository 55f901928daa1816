//! Syndicate user gateway daemon
#[macro_use]
extern crate tracing;

mod cli;
mod server;

use structopt::StructOpt;

#[tokio::main]
async fn main() {
	if std::env::var("RUST_LOG").is_err() {
		std::env::set_var("RUST_LOG", "syndicate=info,syndicate_ug=info,syndicate_ms=info")
	}
	tracing_subscriber::fmt()
		.with_writer(std::io::stderr)
		.with_env_filter(tracing_subscriber::filter::EnvFilter::from_default_env())
		.init();

	let opt = cli::Opt::from_args();
	if let Err(e) = server::run_gateway(opt).await {
		error!("Gateway failed: {}", e);
		std::process::exit(1);
	}
}
