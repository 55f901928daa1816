//! RSA-PSS signing and verification.
//!
//! Every signed record on the wire follows the same convention: the
//! signature field is emptied, the message is serialized, the serialization
//! is signed (PSS, SHA-256, salt length = digest length), and the signature
//! is put back before the final serialize. Verification replays the same
//! steps against the embedded signature.
use std::path::Path;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use rsa::pkcs8::{DecodePrivateKey, DecodePublicKey};
use rsa::{Pss, RsaPrivateKey, RsaPublicKey};
use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::error::Error;

/// A wire message carrying its own signature field
pub trait SignedMessage {
	fn signature(&self) -> &[u8];
	fn set_signature(&mut self, sig: Vec<u8>);
}

pub fn sign_bytes(key: &RsaPrivateKey, data: &[u8]) -> Result<Vec<u8>, Error> {
	let digest = Sha256::digest(data);
	let mut rng = rand::rngs::OsRng;
	Ok(key.sign_with_rng(&mut rng, Pss::new::<Sha256>(), &digest)?)
}

pub fn verify_bytes(key: &RsaPublicKey, data: &[u8], sig: &[u8]) -> Result<(), Error> {
	let digest = Sha256::digest(data);
	Ok(key.verify(Pss::new::<Sha256>(), &digest, sig)?)
}

/// Sign `msg` in place
pub fn sign_message<T>(msg: &mut T, key: &RsaPrivateKey) -> Result<(), Error>
where
	T: SignedMessage + Serialize,
{
	msg.set_signature(Vec::new());
	let bytes = rmp_serde::to_vec_named(msg)?;
	let sig = sign_bytes(key, &bytes)?;
	msg.set_signature(sig);
	Ok(())
}

/// Check the embedded signature of `msg` against `key`
pub fn verify_message<T>(msg: &T, key: &RsaPublicKey) -> Result<(), Error>
where
	T: SignedMessage + Serialize + Clone,
{
	let mut unsigned = msg.clone();
	let sig = unsigned.signature().to_vec();
	unsigned.set_signature(Vec::new());
	let bytes = rmp_serde::to_vec_named(&unsigned)?;
	verify_bytes(key, &bytes, &sig)
}

pub fn load_private_key(pem: &str) -> Result<RsaPrivateKey, Error> {
	Ok(RsaPrivateKey::from_pkcs8_pem(pem)?)
}

pub fn load_public_key(pem: &str) -> Result<RsaPublicKey, Error> {
	Ok(RsaPublicKey::from_public_key_pem(pem)?)
}

pub fn load_private_key_file(path: &Path) -> Result<RsaPrivateKey, Error> {
	load_private_key(&std::fs::read_to_string(path)?)
}

pub fn load_public_key_file(path: &Path) -> Result<RsaPublicKey, Error> {
	load_public_key(&std::fs::read_to_string(path)?)
}

/// Value for an `Authorization` header
pub fn basic_auth_header(username: &str, password: &str) -> String {
	format!(
		"Basic {}",
		BASE64.encode(format!("{}:{}", username, password))
	)
}

pub fn sig_to_b64(sig: &[u8]) -> String {
	BASE64.encode(sig)
}

pub fn sig_from_b64(b64: &str) -> Result<Vec<u8>, Error> {
	BASE64
		.decode(b64)
		.map_err(|e| Error::InvalidRequest(format!("bad signature encoding: {}", e)))
}

#[cfg(test)]
mod tests {
	use super::*;
	use rsa::RsaPublicKey;
	use serde::Deserialize;

	#[derive(Clone, Serialize, Deserialize, PartialEq, Debug)]
	struct TestMsg {
		payload: String,
		counter: u64,
		signature: Vec<u8>,
	}

	impl SignedMessage for TestMsg {
		fn signature(&self) -> &[u8] {
			&self.signature
		}
		fn set_signature(&mut self, sig: Vec<u8>) {
			self.signature = sig;
		}
	}

	fn test_key() -> RsaPrivateKey {
		let mut rng = rand::rngs::OsRng;
		RsaPrivateKey::new(&mut rng, 2048).unwrap()
	}

	#[test]
	fn test_sign_verify_roundtrip() {
		let key = test_key();
		let pubkey = RsaPublicKey::from(&key);

		let mut msg = TestMsg {
			payload: "hello".into(),
			counter: 42,
			signature: vec![],
		};
		sign_message(&mut msg, &key).unwrap();
		assert!(!msg.signature.is_empty());
		verify_message(&msg, &pubkey).unwrap();

		// any field change invalidates the signature
		let mut tampered = msg.clone();
		tampered.counter = 43;
		assert!(verify_message(&tampered, &pubkey).is_err());

		// so does a truncated signature
		let mut clipped = msg;
		clipped.signature.pop();
		assert!(verify_message(&clipped, &pubkey).is_err());
	}

	#[test]
	fn test_basic_auth_header() {
		assert_eq!(
			basic_auth_header("UG_1234", "sekrit"),
			"Basic VUdfMTIzNDpzZWtyaXQ="
		);
	}

	#[test]
	fn test_sig_b64_roundtrip() {
		let sig = vec![0u8, 1, 2, 254, 255];
		assert_eq!(sig_from_b64(&sig_to_b64(&sig)).unwrap(), sig);
		assert!(sig_from_b64("not//base64!!").is_err());
	}
}
