//! Exam Proctor Kernel (EPK)
//!
//! This crate implements the integrity core of a proctored exam session:
//! it turns client-observable signals into violations, locks the session,
//! issues a recovery passkey, and unlocks the session once a trusted party
//! clears the violation.
//!
//! # Architecture
//!
//! The kernel holds four invariants:
//!
//! 1. **One Outstanding Violation**: a session never has more than one
//!    uncleared violation; further signals while locked are ignored.
//! 2. **Append-Only Audit**: violation records are never deleted, and a
//!    cleared record never becomes outstanding again.
//! 3. **Latest Passkey Only**: a student can redeem only the passkey of the
//!    most recent violation of their session.
//! 4. **Frozen Clock**: exam time does not run while the session is locked.
//!
//! # Module Structure
//!
//! - `passkey`: passkey format and CSPRNG-backed issuance
//! - `storage`: the violation store (SQLite and in-memory)
//! - `audit`: hash chain over the violation log
//! - `authority`: passkey verification and student redemption
//! - `monitor`: the session state machine and exam clock
//! - `console`: staff recovery surface and CLI
//! - `api`: HTTP surface used by `proctord`
//! - `config`: `ProctorConfig` loading (JSON file plus environment)
//! - Core types: SessionKey, ViolationReason, Clearance, ViolationRecord

use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use rand::RngCore;
use rusqlite::{Connection, OpenFlags};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

pub mod api;
pub mod audit;
pub mod authority;
pub mod config;
pub mod console;
pub mod monitor;
pub mod passkey;
pub mod storage;

pub use audit::{hash_entry, record_digest, verify_chain, ChainBreak};
pub use authority::{PasskeyAuthority, RedeemOutcome, DEFAULT_MAX_REDEEM_ATTEMPTS};
pub use console::{lock_state, ClearOutcome, LockState, RecoveryConsole, StaffId};
pub use monitor::{
    IntegritySignal, KeyChord, MonitorEvent, MonitorSettings, ScriptedSignals, SessionMonitor,
    SessionState, SignalSource, SubmissionReceipt, SubmitCause,
};
pub use passkey::{FixedTokenIssuer, OsTokenIssuer, Passkey, TokenIssuer};
pub use storage::{
    InMemoryViolationStore, SqliteViolationStore, StatusFilter, TimeWindow, ViolationFilter,
    ViolationStore,
};

pub fn shared_memory_uri() -> String {
    let mut bytes = [0u8; 8];
    rand::thread_rng().fill_bytes(&mut bytes);
    format!(
        "file:proctor_kernel_{:x}?mode=memory&cache=shared",
        u64::from_le_bytes(bytes)
    )
}

pub(crate) fn open_db_connection(db_path: &str) -> Result<Connection> {
    if db_path.starts_with("file:") {
        return Ok(Connection::open_with_flags(
            db_path,
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_URI,
        )?);
    }
    Ok(Connection::open(db_path)?)
}

// -------------------- Session Keys --------------------

/// Identifies one exam session: an exam taken by one student.
///
/// Violations refer to their session by this key; neither side holds a
/// pointer to the other.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "camelCase")]
pub struct SessionKey {
    pub exam_id: String,
    pub student_id: String,
}

impl SessionKey {
    pub fn new(exam_id: &str, student_id: &str) -> Result<Self> {
        if exam_id.trim().is_empty() {
            return Err(anyhow!("exam id cannot be empty"));
        }
        if student_id.trim().is_empty() {
            return Err(anyhow!("student id cannot be empty"));
        }
        Ok(Self {
            exam_id: exam_id.trim().to_string(),
            student_id: student_id.trim().to_string(),
        })
    }
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "exam={} student={}", self.exam_id, self.student_id)
    }
}

// -------------------- Violation Reasons --------------------

const FULLSCREEN_EXIT_FAILED_TEXT: &str = "Failed to enter full-screen mode";
const FULLSCREEN_EXITED_TEXT: &str = "Exited full-screen mode during exam";
const TAB_HIDDEN_TEXT: &str = "Tab changed or minimized during exam";
const KEY_COMBO_TEXT_PREFIX: &str = "Attempted to use restricted key combination: ";
const KEY_COMBO_TAG_PREFIX: &str = "ForbiddenKeyCombo:";

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum ViolationReason {
    /// Full-screen mode could not be acquired when the session started.
    FullscreenExitFailed,
    FullscreenExited,
    TabHidden,
    /// A restricted key chord, e.g. `Alt+Tab`.
    ForbiddenKeyCombo(String),
}

impl ViolationReason {
    /// Stable tag persisted in the violation log.
    pub fn tag(&self) -> String {
        match self {
            Self::FullscreenExitFailed => "FullscreenExitFailed".to_string(),
            Self::FullscreenExited => "FullscreenExited".to_string(),
            Self::TabHidden => "TabHidden".to_string(),
            Self::ForbiddenKeyCombo(chord) => format!("{KEY_COMBO_TAG_PREFIX}{chord}"),
        }
    }

    /// Message shown to students and staff.
    pub fn describe(&self) -> String {
        match self {
            Self::FullscreenExitFailed => FULLSCREEN_EXIT_FAILED_TEXT.to_string(),
            Self::FullscreenExited => FULLSCREEN_EXITED_TEXT.to_string(),
            Self::TabHidden => TAB_HIDDEN_TEXT.to_string(),
            Self::ForbiddenKeyCombo(chord) => format!("{KEY_COMBO_TEXT_PREFIX}{chord}"),
        }
    }

    /// Lower is more specific. When one tick carries several qualifying
    /// signals, the most specific one names the violation.
    pub(crate) fn specificity(&self) -> u8 {
        match self {
            Self::ForbiddenKeyCombo(_) => 0,
            Self::FullscreenExitFailed => 1,
            Self::FullscreenExited => 2,
            Self::TabHidden => 3,
        }
    }
}

impl fmt::Display for ViolationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.describe())
    }
}

impl FromStr for ViolationReason {
    type Err = anyhow::Error;

    /// Accepts both the persisted tags and the human-readable messages of
    /// older logs.
    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        match s {
            "FullscreenExitFailed" | FULLSCREEN_EXIT_FAILED_TEXT => {
                return Ok(Self::FullscreenExitFailed)
            }
            "FullscreenExited" | FULLSCREEN_EXITED_TEXT => return Ok(Self::FullscreenExited),
            "TabHidden" | TAB_HIDDEN_TEXT => return Ok(Self::TabHidden),
            _ => {}
        }
        let chord = s
            .strip_prefix(KEY_COMBO_TAG_PREFIX)
            .or_else(|| s.strip_prefix(KEY_COMBO_TEXT_PREFIX))
            .ok_or_else(|| anyhow!("unrecognized violation reason: {}", s))?;
        if chord.trim().is_empty() {
            return Err(anyhow!("key combination violation is missing its chord"));
        }
        Ok(Self::ForbiddenKeyCombo(chord.trim().to_string()))
    }
}

impl TryFrom<String> for ViolationReason {
    type Error = anyhow::Error;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<ViolationReason> for String {
    fn from(value: ViolationReason) -> Self {
        value.tag()
    }
}

// -------------------- Clearance --------------------

/// Who resolved a violation.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Clearance {
    /// The student presented the passkey.
    Passkey,
    /// A staff member cleared it from the recovery console.
    Staff(String),
    /// Resolved on import because a newer violation of the same session
    /// was still outstanding.
    Superseded,
}

impl fmt::Display for Clearance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Passkey => f.write_str("passkey"),
            Self::Staff(id) => write!(f, "staff:{id}"),
            Self::Superseded => f.write_str("superseded"),
        }
    }
}

impl FromStr for Clearance {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "passkey" => return Ok(Self::Passkey),
            "superseded" => return Ok(Self::Superseded),
            _ => {}
        }
        match s.strip_prefix("staff:") {
            Some(id) if !id.trim().is_empty() => Ok(Self::Staff(id.trim().to_string())),
            _ => Err(anyhow!("unrecognized clearance: {}", s)),
        }
    }
}

impl TryFrom<String> for Clearance {
    type Error = anyhow::Error;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<Clearance> for String {
    fn from(value: Clearance) -> Self {
        value.to_string()
    }
}

// -------------------- Violation Records --------------------

/// One integrity breach and its resolution.
///
/// Fields are private: outside the store a record is read-only, and the
/// store itself only ever moves `cleared` from `false` to `true`.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ViolationRecord {
    #[serde(flatten)]
    key: SessionKey,
    timestamp: DateTime<Utc>,
    reason: ViolationReason,
    passkey: Passkey,
    #[serde(default)]
    cleared: bool,
    #[serde(default)]
    cleared_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    cleared_by: Option<Clearance>,
    #[serde(skip)]
    entry_hash: [u8; 32],
}

impl ViolationRecord {
    pub(crate) fn new(
        key: SessionKey,
        timestamp: DateTime<Utc>,
        reason: ViolationReason,
        passkey: Passkey,
    ) -> Self {
        Self {
            key,
            timestamp,
            reason,
            passkey,
            cleared: false,
            cleared_at: None,
            cleared_by: None,
            entry_hash: [0u8; 32],
        }
    }

    /// Rebuilds a record read back from storage.
    pub(crate) fn from_parts(
        key: SessionKey,
        timestamp: DateTime<Utc>,
        reason: ViolationReason,
        passkey: Passkey,
        cleared_at: Option<DateTime<Utc>>,
        cleared_by: Option<Clearance>,
        entry_hash: [u8; 32],
    ) -> Self {
        Self {
            key,
            timestamp,
            reason,
            passkey,
            cleared: cleared_at.is_some(),
            cleared_at,
            cleared_by,
            entry_hash,
        }
    }

    pub fn key(&self) -> &SessionKey {
        &self.key
    }

    pub fn exam_id(&self) -> &str {
        &self.key.exam_id
    }

    pub fn student_id(&self) -> &str {
        &self.key.student_id
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn reason(&self) -> &ViolationReason {
        &self.reason
    }

    pub fn passkey(&self) -> &Passkey {
        &self.passkey
    }

    pub fn is_cleared(&self) -> bool {
        self.cleared
    }

    pub fn cleared_at(&self) -> Option<DateTime<Utc>> {
        self.cleared_at
    }

    pub fn cleared_by(&self) -> Option<&Clearance> {
        self.cleared_by.as_ref()
    }

    pub fn entry_hash(&self) -> [u8; 32] {
        self.entry_hash
    }

    pub(crate) fn set_entry_hash(&mut self, entry_hash: [u8; 32]) {
        self.entry_hash = entry_hash;
    }

    pub(crate) fn mark_cleared(&mut self, at: DateTime<Utc>, by: Clearance) {
        if self.cleared {
            return;
        }
        self.cleared = true;
        self.cleared_at = Some(at);
        self.cleared_by = Some(by);
    }

    /// Normalizes a record arriving from an older log so the cleared flag
    /// and its timestamp agree.
    pub(crate) fn reconcile_clearance(&mut self) -> Result<()> {
        match (self.cleared, self.cleared_at) {
            (true, None) => Err(anyhow!(
                "cleared violation for {} is missing clearedAt",
                self.key
            )),
            (false, Some(_)) => Err(anyhow!(
                "outstanding violation for {} carries clearedAt",
                self.key
            )),
            (false, None) => {
                self.cleared_by = None;
                Ok(())
            }
            (true, Some(_)) => Ok(()),
        }
    }
}

/// Current wall-clock time at the millisecond precision the log keeps.
pub(crate) fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

pub(crate) fn datetime_from_ms(ms: i64) -> Result<DateTime<Utc>> {
    DateTime::<Utc>::from_timestamp_millis(ms)
        .ok_or_else(|| anyhow!("timestamp out of range: {} ms", ms))
}

// -------------------- Conformance Tests --------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_key_trims_and_rejects_empty_ids() {
        let key = SessionKey::new(" exam-1 ", "student-9").unwrap();
        assert_eq!(key.exam_id, "exam-1");
        assert!(SessionKey::new("", "s").is_err());
        assert!(SessionKey::new("e", "   ").is_err());
    }

    #[test]
    fn reason_tags_round_trip_and_accept_legacy_text() {
        let combo = ViolationReason::ForbiddenKeyCombo("Alt+Tab".to_string());
        assert_eq!(combo.tag(), "ForbiddenKeyCombo:Alt+Tab");
        assert_eq!(combo.tag().parse::<ViolationReason>().unwrap(), combo);
        assert_eq!(
            "Attempted to use restricted key combination: Ctrl+p"
                .parse::<ViolationReason>()
                .unwrap(),
            ViolationReason::ForbiddenKeyCombo("Ctrl+p".to_string())
        );
        assert_eq!(
            "Tab changed or minimized during exam"
                .parse::<ViolationReason>()
                .unwrap(),
            ViolationReason::TabHidden
        );
        assert!("Looked away".parse::<ViolationReason>().is_err());
        assert!("ForbiddenKeyCombo:".parse::<ViolationReason>().is_err());
    }

    #[test]
    fn clearance_parses_staff_identity() {
        assert_eq!("passkey".parse::<Clearance>().unwrap(), Clearance::Passkey);
        assert_eq!(
            "staff:alice".parse::<Clearance>().unwrap(),
            Clearance::Staff("alice".to_string())
        );
        assert!("staff:".parse::<Clearance>().is_err());
        assert_eq!(
            "superseded".parse::<Clearance>().unwrap(),
            Clearance::Superseded
        );
    }

    #[test]
    fn record_json_uses_the_flat_camel_case_schema() {
        let key = SessionKey::new("exam-1", "student-1").unwrap();
        let ts = datetime_from_ms(1_700_000_000_123).unwrap();
        let record = ViolationRecord::new(
            key,
            ts,
            ViolationReason::FullscreenExited,
            Passkey::parse("XQ7T-PLM4-9VKR").unwrap(),
        );
        let value = serde_json::to_value(&record).unwrap();
        assert_eq!(value["examId"], "exam-1");
        assert_eq!(value["studentId"], "student-1");
        assert_eq!(value["reason"], "FullscreenExited");
        assert_eq!(value["passkey"], "XQ7T-PLM4-9VKR");
        assert_eq!(value["cleared"], false);
        assert!(value["clearedAt"].is_null());
        assert!(value.get("clearedBy").is_none());
        assert!(value["timestamp"].as_str().unwrap().starts_with("2023-11-14T22:13:20.123"));
    }

    #[test]
    fn legacy_json_record_is_accepted() {
        let json = r#"{
            "examId": "exam-7",
            "studentId": "student123",
            "timestamp": "2024-03-01T09:15:00.000Z",
            "reason": "Exited full-screen mode during exam",
            "passkey": "ABCD-EFGH-JKLM",
            "cleared": true,
            "clearedAt": "2024-03-01T09:20:00.000Z"
        }"#;
        let mut record: ViolationRecord = serde_json::from_str(json).unwrap();
        record.reconcile_clearance().unwrap();
        assert_eq!(record.reason(), &ViolationReason::FullscreenExited);
        assert!(record.is_cleared());
        assert!(record.cleared_by().is_none());
    }

    #[test]
    fn mark_cleared_is_one_way() {
        let key = SessionKey::new("e", "s").unwrap();
        let mut record = ViolationRecord::new(
            key,
            Utc::now(),
            ViolationReason::TabHidden,
            Passkey::parse("ABCD-EFGH-JKLM").unwrap(),
        );
        let first = datetime_from_ms(1_000).unwrap();
        record.mark_cleared(first, Clearance::Passkey);
        record.mark_cleared(datetime_from_ms(2_000).unwrap(), Clearance::Staff("x".into()));
        assert!(record.is_cleared());
        assert_eq!(record.cleared_at(), Some(first));
        assert_eq!(record.cleared_by(), Some(&Clearance::Passkey));
    }
}
