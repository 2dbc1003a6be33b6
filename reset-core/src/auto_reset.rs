use std::collections::HashMap;

use reset_types::{BadBinaryInfo, ResetPointInfo};

/// Scans a workflow's reset-point history for the first point that is resettable,
/// not expired, and matches a binary checksum the operator has flagged as bad.
/// Points are checked in the order given, which is expected to be oldest-first so
/// the earliest bad point wins.
pub fn find_auto_reset_point<'a>(
	bad_binaries: &HashMap<String, BadBinaryInfo>,
	reset_points: &'a [ResetPointInfo],
	now_nanos: i64,
) -> Option<(&'a str, &'a ResetPointInfo)> {
	for point in reset_points {
		let Some(bad) = bad_binaries.get(&point.binary_checksum) else {
			continue;
		};
		if !point.resettable {
			continue;
		}
		if point.expiring_timestamp_nanos != 0 && now_nanos > point.expiring_timestamp_nanos {
			continue;
		}
		return Some((bad.reason.as_str(), point));
	}
	None
}

#[cfg(test)]
mod tests {
	use super::*;
	use reset_types::RunId;

	fn point(checksum: &str, resettable: bool, expiring: i64) -> ResetPointInfo {
		ResetPointInfo {
			binary_checksum: checksum.to_string(),
			run_id: RunId::new(),
			first_decision_completed_id: 1,
			created_timestamp_nanos: 0,
			expiring_timestamp_nanos: expiring,
			resettable,
		}
	}

	#[test]
	fn matches_first_bad_resettable_point() {
		let mut bad = HashMap::new();
		bad.insert(
			"csum-X".to_string(),
			BadBinaryInfo {
				reason: "bad".to_string(),
				created_timestamp_nanos: 0,
			},
		);
		let points = vec![point("csum-Y", true, 0), point("csum-X", true, 0)];

		let (reason, found) = find_auto_reset_point(&bad, &points, 100).expect("should match");
		assert_eq!(reason, "bad");
		assert_eq!(found.binary_checksum, "csum-X");
	}

	#[test]
	fn skips_non_resettable_and_expired() {
		let mut bad = HashMap::new();
		bad.insert(
			"csum-X".to_string(),
			BadBinaryInfo {
				reason: "bad".to_string(),
				created_timestamp_nanos: 0,
			},
		);
		let points = vec![point("csum-X", false, 0), point("csum-X", true, 50)];

		assert!(find_auto_reset_point(&bad, &points, 100).is_none());
	}

	#[test]
	fn no_match_returns_none() {
		let bad = HashMap::new();
		let points = vec![point("csum-X", true, 0)];
		assert!(find_auto_reset_point(&bad, &points, 100).is_none());
	}
}
