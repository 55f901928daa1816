//! Gateway configuration file (TOML)
use std::io::Read;
use std::path::PathBuf;

use serde::Deserialize;

use crate::error::Error;

#[derive(Deserialize, Debug, Clone)]
pub struct Config {
	/// Name of the volume this gateway is bound to
	pub volume_name: String,
	/// Base URL of the metadata service
	pub ms_url: String,
	/// Syndicate user account owning this gateway
	pub username: String,
	/// Name under which this gateway is registered on the MS
	pub gateway_name: String,

	/// Root of the on-disk block cache
	pub data_root: PathBuf,
	/// PEM file holding the volume public key
	pub volume_pubkey_path: PathBuf,
	/// PEM file holding this gateway's RSA private key
	pub gateway_key_path: PathBuf,

	/// TLS material for the peer-facing listener, if served directly
	pub tls_key_path: Option<PathBuf>,
	pub tls_cert_path: Option<PathBuf>,

	/// Port the peer-facing HTTP server binds to
	#[serde(default = "default_listen_port")]
	pub listen_port: u16,

	/// Cache limits, in bytes. Converted to block counts at startup using
	/// the volume blocksize.
	#[serde(default = "default_cache_soft_limit")]
	pub cache_soft_limit: u64,
	#[serde(default = "default_cache_hard_limit")]
	pub cache_hard_limit: u64,

	/// Maximum concurrent transfers per downloader
	#[serde(default = "default_max_downloads")]
	pub max_downloads: usize,

	/// Number of replica upload workers
	#[serde(default = "default_replica_workers")]
	pub replica_workers: usize,

	/// How often the volume/certificate view is refetched
	#[serde(default = "default_view_reload_freq_ms")]
	pub view_reload_freq_ms: u64,

	#[serde(default = "default_connect_timeout_ms")]
	pub connect_timeout_ms: u64,
	#[serde(default = "default_transfer_timeout_ms")]
	pub transfer_timeout_ms: u64,

	/// Verify TLS certificates of peers and the MS
	#[serde(default = "default_verify_peer")]
	pub verify_peer: bool,

	/// Where the pidfile goes
	pub pidfile_path: Option<PathBuf>,
}

fn default_listen_port() -> u16 {
	32780
}
fn default_cache_soft_limit() -> u64 {
	50_000_000
}
fn default_cache_hard_limit() -> u64 {
	100_000_000
}
fn default_max_downloads() -> usize {
	10
}
fn default_replica_workers() -> usize {
	4
}
fn default_view_reload_freq_ms() -> u64 {
	300_000
}
fn default_connect_timeout_ms() -> u64 {
	10_000
}
fn default_transfer_timeout_ms() -> u64 {
	300_000
}
fn default_verify_peer() -> bool {
	true
}

/// Read and parse configuration
pub fn read_config(config_file: PathBuf) -> Result<Config, Error> {
	let mut file = std::fs::OpenOptions::new()
		.read(true)
		.open(config_file.as_path())?;

	let mut config = String::new();
	file.read_to_string(&mut config)?;

	Ok(toml::from_str(&config)?)
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_parse_minimal_config() {
		let config: Config = toml::from_str(
			r#"
			volume_name = "testvolume"
			ms_url = "https://ms.example.com"
			username = "alice@example.com"
			gateway_name = "ug-laptop"
			data_root = "/var/cache/syndicate"
			volume_pubkey_path = "/etc/syndicate/volume.pub"
			gateway_key_path = "/etc/syndicate/gateway.pem"
			"#,
		)
		.unwrap();

		assert_eq!(config.listen_port, 32780);
		assert_eq!(config.cache_soft_limit, 50_000_000);
		assert_eq!(config.cache_hard_limit, 100_000_000);
		assert_eq!(config.max_downloads, 10);
		assert!(config.verify_peer);
		assert!(config.tls_key_path.is_none());
	}

	#[test]
	fn test_parse_overrides() {
		let config: Config = toml::from_str(
			r#"
			volume_name = "v"
			ms_url = "https://ms"
			username = "u"
			gateway_name = "g"
			data_root = "/d"
			volume_pubkey_path = "/vp"
			gateway_key_path = "/gk"
			listen_port = 9999
			cache_soft_limit = 1000
			cache_hard_limit = 2000
			verify_peer = false
			"#,
		)
		.unwrap();

		assert_eq!(config.listen_port, 9999);
		assert_eq!(config.cache_soft_limit, 1000);
		assert!(!config.verify_peer);
	}
}
