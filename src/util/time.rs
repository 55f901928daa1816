//! Clock helpers
use std::time::{SystemTime, UNIX_EPOCH};

use chrono::{SecondsFormat, TimeZone, Utc};

pub fn now_msec() -> u64 {
	SystemTime::now()
		.duration_since(UNIX_EPOCH)
		.expect("Fix your clock :o")
		.as_millis() as u64
}

/// (seconds, nanoseconds) pair used for manifest timestamps
pub fn now_timespec() -> (i64, u32) {
	let d = SystemTime::now()
		.duration_since(UNIX_EPOCH)
		.expect("Fix your clock :o");
	(d.as_secs() as i64, d.subsec_nanos())
}

pub fn msec_to_rfc3339(msecs: u64) -> String {
	let secs = msecs as i64 / 1000;
	let nanos = (msecs as i64 % 1000) as u32 * 1_000_000;
	let timestamp = Utc.timestamp_opt(secs, nanos).unwrap();
	timestamp.to_rfc3339_opts(SecondsFormat::Millis, true)
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_msec_to_rfc3339() {
		assert_eq!(msec_to_rfc3339(0), "1970-01-01T00:00:00.000Z");
		assert_eq!(msec_to_rfc3339(1_234), "1970-01-01T00:00:01.234Z");
	}

	#[test]
	fn test_now_timespec_sane() {
		let (sec, nsec) = now_timespec();
		assert!(sec > 1_500_000_000);
		assert!(nsec < 1_000_000_000);
	}
}
