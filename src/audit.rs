//! Hash chain over the violation log.
//!
//! Each record's `entry_hash` commits to the previous entry hash and to the
//! fields fixed at detection time. Clearing a record does not touch those
//! fields, so clears never break the chain; deleting, reordering, or editing
//! a record does.

use anyhow::Result;
use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::ViolationRecord;

/// Hashes a log entry payload with the previous chain hash.
pub fn hash_entry(prev_hash: &[u8; 32], payload: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(prev_hash);
    hasher.update(payload);
    hasher.finalize().into()
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ChainedFields<'a> {
    exam_id: &'a str,
    student_id: &'a str,
    timestamp_ms: i64,
    reason: String,
    passkey: &'a str,
}

/// Canonical bytes of the immutable part of a record.
pub fn record_digest(record: &ViolationRecord) -> Result<Vec<u8>> {
    let fields = ChainedFields {
        exam_id: record.exam_id(),
        student_id: record.student_id(),
        timestamp_ms: record.timestamp().timestamp_millis(),
        reason: record.reason().tag(),
        passkey: record.passkey().as_str(),
    };
    Ok(serde_json::to_vec(&fields)?)
}

/// Computes the entry hash `record` gets when appended after `prev_hash`.
pub(crate) fn chain_record(prev_hash: &[u8; 32], record: &ViolationRecord) -> Result<[u8; 32]> {
    Ok(hash_entry(prev_hash, &record_digest(record)?))
}

/// First position where the recomputed chain disagrees with the stored one.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChainBreak {
    pub index: usize,
    pub expected: [u8; 32],
    pub found: [u8; 32],
}

impl std::fmt::Display for ChainBreak {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "audit chain broken at entry {}: expected {}, found {}",
            self.index,
            hex::encode(self.expected),
            hex::encode(self.found)
        )
    }
}

/// Recomputes the chain over `records` in insertion order.
pub fn verify_chain(records: &[ViolationRecord]) -> Result<Option<ChainBreak>> {
    let mut prev = [0u8; 32];
    for (index, record) in records.iter().enumerate() {
        let expected = chain_record(&prev, record)?;
        if expected != record.entry_hash() {
            return Ok(Some(ChainBreak {
                index,
                expected,
                found: record.entry_hash(),
            }));
        }
        prev = expected;
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{datetime_from_ms, Clearance, Passkey, SessionKey, ViolationReason};

    fn chained(n: usize) -> Vec<ViolationRecord> {
        let key = SessionKey::new("exam-1", "student-1").unwrap();
        let mut prev = [0u8; 32];
        (0..n)
            .map(|i| {
                let mut record = ViolationRecord::new(
                    key.clone(),
                    datetime_from_ms(1_000 + i as i64).unwrap(),
                    ViolationReason::TabHidden,
                    Passkey::parse("ABCD-EFGH-JKLM").unwrap(),
                );
                let hash = chain_record(&prev, &record).unwrap();
                record.set_entry_hash(hash);
                prev = hash;
                record
            })
            .collect()
    }

    #[test]
    fn intact_chain_verifies() {
        assert_eq!(verify_chain(&chained(4)).unwrap(), None);
        assert_eq!(verify_chain(&[]).unwrap(), None);
    }

    #[test]
    fn clearing_does_not_break_the_chain() {
        let mut records = chained(3);
        records[1].mark_cleared(datetime_from_ms(9_000).unwrap(), Clearance::Passkey);
        assert_eq!(verify_chain(&records).unwrap(), None);
    }

    #[test]
    fn removed_entry_is_detected() {
        let mut records = chained(3);
        records.remove(1);
        let brk = verify_chain(&records).unwrap().expect("break");
        assert_eq!(brk.index, 1);
    }

    #[test]
    fn hash_depends_on_prev() {
        let a = hash_entry(&[0u8; 32], b"payload");
        let b = hash_entry(&[1u8; 32], b"payload");
        assert_ne!(a, b);
    }
}
