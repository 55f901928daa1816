//! Core identifier types shared by every gateway subsystem
use serde::{Deserialize, Serialize};

pub type UserId = u64;
pub type VolumeId = u64;
pub type GatewayId = u64;
pub type FileId = u64;
pub type BlockId = u64;
pub type FileVersion = i64;
pub type BlockVersion = i64;
pub type WriteNonce = i64;

/// Capability bits carried in a gateway certificate
pub const CAP_READ_DATA: u64 = 0x1;
pub const CAP_WRITE_DATA: u64 = 0x2;
pub const CAP_READ_METADATA: u64 = 0x4;
pub const CAP_WRITE_METADATA: u64 = 0x8;
pub const CAP_COORDINATE: u64 = 0x10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum GatewayType {
	UG,
	RG,
	AG,
}

impl GatewayType {
	pub fn as_str(&self) -> &'static str {
		match self {
			GatewayType::UG => "UG",
			GatewayType::RG => "RG",
			GatewayType::AG => "AG",
		}
	}

	pub fn from_str(s: &str) -> Option<Self> {
		match s {
			"UG" => Some(GatewayType::UG),
			"RG" => Some(GatewayType::RG),
			"AG" => Some(GatewayType::AG),
			_ => None,
		}
	}
}

impl std::fmt::Display for GatewayType {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.write_str(self.as_str())
	}
}

/// Fixed-width hex form used in on-disk paths and URLs
pub fn file_id_hex(file_id: FileId) -> String {
	format!("{:016x}", file_id)
}

pub fn parse_file_id_hex(s: &str) -> Option<FileId> {
	if s.len() != 16 {
		return None;
	}
	FileId::from_str_radix(s, 16).ok()
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_file_id_hex_roundtrip() {
		let id: FileId = 0xdead_beef_0123_4567;
		let h = file_id_hex(id);
		assert_eq!(h.len(), 16);
		assert_eq!(parse_file_id_hex(&h), Some(id));
		assert_eq!(parse_file_id_hex("xyz"), None);
		assert_eq!(parse_file_id_hex(""), None);
	}

	#[test]
	fn test_gateway_type_strings() {
		for gt in [GatewayType::UG, GatewayType::RG, GatewayType::AG] {
			assert_eq!(GatewayType::from_str(gt.as_str()), Some(gt));
		}
		assert_eq!(GatewayType::from_str("XG"), None);
	}
}
