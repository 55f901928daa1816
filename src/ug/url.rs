//! Peer URL scheme:
//! `/{gateway_type}/{volume_id}/{fs_path}.{file_version}/{block_id}.{block_version}`
//! for blocks, with `manifest.{sec}.{nsec}` in place of the block segment
//! for manifests.
use percent_encoding::{utf8_percent_encode, AsciiSet, CONTROLS};

use syndicate_ms::GatewayCert;
use syndicate_util::data::*;

const PATH_ENCODE: &AsciiSet = &CONTROLS
	.add(b' ')
	.add(b'?')
	.add(b'#')
	.add(b'%')
	.add(b'"')
	.add(b'<')
	.add(b'>');

pub fn gateway_base(cert: &GatewayCert) -> String {
	format!("http://{}:{}", cert.host, cert.port)
}

fn encode_fs_path(fs_path: &str) -> String {
	fs_path
		.split('/')
		.map(|seg| utf8_percent_encode(seg, PATH_ENCODE).to_string())
		.collect::<Vec<_>>()
		.join("/")
}

/// Path part shared by all data URLs of one file version
pub fn file_path_segment(
	gateway_type: GatewayType,
	volume_id: VolumeId,
	fs_path: &str,
	file_version: FileVersion,
) -> String {
	format!(
		"/{}/{}{}.{}",
		gateway_type,
		volume_id,
		encode_fs_path(fs_path),
		file_version
	)
}

pub fn block_url(
	cert: &GatewayCert,
	volume_id: VolumeId,
	fs_path: &str,
	file_version: FileVersion,
	block_id: BlockId,
	block_version: BlockVersion,
) -> String {
	format!(
		"{}{}/{}.{}",
		gateway_base(cert),
		file_path_segment(cert.gateway_type, volume_id, fs_path, file_version),
		block_id,
		block_version
	)
}

pub fn manifest_url(
	cert: &GatewayCert,
	volume_id: VolumeId,
	fs_path: &str,
	file_version: FileVersion,
	mtime: (i64, u32),
) -> String {
	format!(
		"{}{}/manifest.{}.{}",
		gateway_base(cert),
		file_path_segment(cert.gateway_type, volume_id, fs_path, file_version),
		mtime.0,
		mtime.1
	)
}

/// Resolve a Location header against the URL that produced it; peers
/// redirect with absolute paths
pub fn resolve_location(base_url: &str, location: &str) -> String {
	if location.starts_with("http://") || location.starts_with("https://") {
		return location.to_string();
	}
	let origin_end = base_url
		.find("://")
		.map(|i| i + 3)
		.and_then(|start| base_url[start..].find('/').map(|i| start + i))
		.unwrap_or(base_url.len());
	format!("{}{}", &base_url[..origin_end], location)
}

/// URL a signed WriteMsg is POSTed to
pub fn writemsg_url(cert: &GatewayCert, volume_id: VolumeId, fs_path: &str) -> String {
	format!(
		"{}/{}/{}{}",
		gateway_base(cert),
		cert.gateway_type,
		volume_id,
		encode_fs_path(fs_path)
	)
}
