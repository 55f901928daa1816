use std::path::PathBuf;

use structopt::StructOpt;

use syndicate_util::config::Config;

#[derive(StructOpt, Debug)]
#[structopt(name = "syndicate-ug", about = "Syndicate user gateway")]
pub struct Opt {
	/// Configuration file
	#[structopt(short = "c", long = "config", default_value = "./syndicate.toml")]
	pub config_file: PathBuf,

	/// Volume to bind to (overrides the config file)
	#[structopt(short = "v", long = "volume")]
	pub volume: Option<String>,

	/// Syndicate account username
	#[structopt(short = "u", long = "username")]
	pub username: Option<String>,

	/// Session password (skips the interactive prompt)
	#[structopt(short = "p", long = "password")]
	pub password: Option<String>,

	/// Name of this gateway on the MS
	#[structopt(short = "g", long = "gateway")]
	pub gateway_name: Option<String>,

	/// Port for the peer-facing listener
	#[structopt(short = "P", long = "port")]
	pub listen_port: Option<u16>,

	/// Metadata service URL
	#[structopt(short = "m", long = "ms-url")]
	pub ms_url: Option<String>,

	/// Volume public key (PEM)
	#[structopt(short = "V", long = "volume-pubkey")]
	pub volume_pubkey: Option<PathBuf>,

	/// Gateway private key (PEM)
	#[structopt(short = "G", long = "gateway-pkey")]
	pub gateway_pkey: Option<PathBuf>,

	/// TLS private key for the listener
	#[structopt(short = "S", long = "tls-pkey")]
	pub tls_pkey: Option<PathBuf>,

	/// TLS certificate for the listener
	#[structopt(short = "C", long = "tls-cert")]
	pub tls_cert: Option<PathBuf>,

	/// Stay in the foreground (front-end flag, accepted for parity)
	#[structopt(short = "f", long = "foreground")]
	pub foreground: bool,
}

/// Command-line flags override their config-file counterparts
pub fn apply_overrides(config: &mut Config, opt: &Opt) {
	if let Some(v) = &opt.volume {
		config.volume_name = v.clone();
	}
	if let Some(u) = &opt.username {
		config.username = u.clone();
	}
	if let Some(g) = &opt.gateway_name {
		config.gateway_name = g.clone();
	}
	if let Some(p) = opt.listen_port {
		config.listen_port = p;
	}
	if let Some(m) = &opt.ms_url {
		config.ms_url = m.clone();
	}
	if let Some(k) = &opt.volume_pubkey {
		config.volume_pubkey_path = k.clone();
	}
	if let Some(k) = &opt.gateway_pkey {
		config.gateway_key_path = k.clone();
	}
	if let Some(k) = &opt.tls_pkey {
		config.tls_key_path = Some(k.clone());
	}
	if let Some(k) = &opt.tls_cert {
		config.tls_cert_path = Some(k.clone());
	}
}
