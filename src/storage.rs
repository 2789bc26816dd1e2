use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use std::str::FromStr;
use std::time::Duration;

use crate::audit::chain_record;
use crate::passkey::{OsTokenIssuer, Passkey, TokenIssuer};
use crate::{
    datetime_from_ms, now_ms, open_db_connection, Clearance, SessionKey, ViolationReason,
    ViolationRecord,
};

const WEEK_MS: i64 = 7 * 24 * 60 * 60 * 1000;
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// The violation log: append-only, and the single source of truth for
/// whether a session is locked.
pub trait ViolationStore {
    /// Appends a violation with a freshly issued passkey. Fails if the
    /// session already has an outstanding violation.
    fn record(&mut self, key: &SessionKey, reason: ViolationReason) -> Result<ViolationRecord>;

    /// Most recent uncleared violation of the session.
    fn find_outstanding(&self, key: &SessionKey) -> Result<Option<ViolationRecord>>;

    /// Clears the violation matching all of `key` and `passkey`. Clearing an
    /// already-cleared violation succeeds without change; `false` means no
    /// such violation exists.
    fn clear(&mut self, key: &SessionKey, passkey: &Passkey, by: &Clearance) -> Result<bool>;

    /// Matching violations, newest first.
    fn list(&self, filter: &ViolationFilter) -> Result<Vec<ViolationRecord>>;

    /// Every violation of the session, newest first.
    fn records_for(&self, key: &SessionKey) -> Result<Vec<ViolationRecord>>;

    /// Most recent violation carrying `passkey`, in any session.
    fn find_by_passkey(&self, passkey: &Passkey) -> Result<Option<ViolationRecord>>;

    /// Appends records from an older log as they are, cleared state included.
    /// A session left with several outstanding violations keeps only the
    /// newest one; the older ones are cleared as [`Clearance::Superseded`].
    fn import(&mut self, records: Vec<ViolationRecord>) -> Result<usize>;

    /// Every violation in insertion order, with entry hashes.
    fn audit_trail(&self) -> Result<Vec<ViolationRecord>>;
}

// -------------------- Filters --------------------

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum StatusFilter {
    #[default]
    All,
    /// Outstanding violations only.
    Active,
    Cleared,
}

impl FromStr for StatusFilter {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "all" | "" => Ok(Self::All),
            "active" => Ok(Self::Active),
            "cleared" => Ok(Self::Cleared),
            other => Err(anyhow!("unknown status filter: {}", other)),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum TimeWindow {
    #[default]
    All,
    /// Same UTC calendar day as the filter's reference time.
    Today,
    /// Less than seven days before the reference time.
    Week,
}

impl FromStr for TimeWindow {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "all" | "" => Ok(Self::All),
            "today" => Ok(Self::Today),
            "week" => Ok(Self::Week),
            other => Err(anyhow!("unknown time window: {}", other)),
        }
    }
}

#[derive(Clone, Debug)]
pub struct ViolationFilter {
    pub status: StatusFilter,
    pub window: TimeWindow,
    pub search: Option<String>,
    pub as_of: DateTime<Utc>,
}

impl ViolationFilter {
    pub fn new() -> Self {
        Self {
            status: StatusFilter::All,
            window: TimeWindow::All,
            search: None,
            as_of: Utc::now(),
        }
    }

    pub fn status(mut self, status: StatusFilter) -> Self {
        self.status = status;
        self
    }

    pub fn window(mut self, window: TimeWindow) -> Self {
        self.window = window;
        self
    }

    pub fn search(mut self, text: &str) -> Self {
        let text = text.trim();
        self.search = if text.is_empty() {
            None
        } else {
            Some(text.to_lowercase())
        };
        self
    }

    pub fn as_of(mut self, as_of: DateTime<Utc>) -> Self {
        self.as_of = as_of;
        self
    }

    pub fn matches(&self, record: &ViolationRecord) -> bool {
        let status_ok = match self.status {
            StatusFilter::All => true,
            StatusFilter::Active => !record.is_cleared(),
            StatusFilter::Cleared => record.is_cleared(),
        };
        let window_ok = match self.window {
            TimeWindow::All => true,
            TimeWindow::Today => record.timestamp().date_naive() == self.as_of.date_naive(),
            TimeWindow::Week => {
                self.as_of.timestamp_millis() - record.timestamp().timestamp_millis() < WEEK_MS
            }
        };
        status_ok && window_ok && self.matches_text(record)
    }

    fn matches_text(&self, record: &ViolationRecord) -> bool {
        let Some(needle) = self.search.as_deref() else {
            return true;
        };
        [
            record.exam_id().to_lowercase(),
            record.student_id().to_lowercase(),
            record.reason().tag().to_lowercase(),
            record.reason().describe().to_lowercase(),
            record.passkey().as_str().to_lowercase(),
        ]
        .iter()
        .any(|field| field.contains(needle))
    }
}

impl Default for ViolationFilter {
    fn default() -> Self {
        Self::new()
    }
}

/// Timestamps are strictly increasing across the log, even when the wall
/// clock stalls or steps backwards.
fn next_timestamp_ms(last_ms: Option<i64>) -> i64 {
    let now = now_ms();
    match last_ms {
        Some(last) if now <= last => last + 1,
        _ => now,
    }
}

/// Sessions an import batch leaves with at least one outstanding violation.
fn sessions_with_outstanding(records: &[ViolationRecord]) -> Vec<SessionKey> {
    let mut keys: Vec<SessionKey> = Vec::new();
    for record in records.iter().filter(|r| !r.is_cleared()) {
        if !keys.contains(record.key()) {
            keys.push(record.key().clone());
        }
    }
    keys
}

fn validate_import(records: Vec<ViolationRecord>) -> Result<Vec<ViolationRecord>> {
    records
        .into_iter()
        .map(|mut record| {
            SessionKey::new(record.exam_id(), record.student_id())?;
            record.reconcile_clearance()?;
            Ok(record)
        })
        .collect()
}

// -------------------- SQLite --------------------

pub struct SqliteViolationStore {
    conn: Connection,
    issuer: Box<dyn TokenIssuer>,
}

const RECORD_COLUMNS: &str =
    "exam_id, student_id, ts_ms, reason, passkey, cleared_at_ms, cleared_by, entry_hash";

impl SqliteViolationStore {
    pub fn open(db_path: &str) -> Result<Self> {
        Self::open_with_issuer(db_path, Box::new(OsTokenIssuer))
    }

    pub fn open_with_issuer(db_path: &str, issuer: Box<dyn TokenIssuer>) -> Result<Self> {
        let conn = open_db_connection(db_path)?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        let mut store = Self { conn, issuer };
        store.ensure_schema()?;
        Ok(store)
    }

    fn ensure_schema(&mut self) -> Result<()> {
        self.conn.execute_batch(
            r#"
            PRAGMA journal_mode=WAL;

            CREATE TABLE IF NOT EXISTS violations (
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              exam_id TEXT NOT NULL,
              student_id TEXT NOT NULL,
              ts_ms INTEGER NOT NULL,
              reason TEXT NOT NULL,
              passkey TEXT NOT NULL,
              cleared INTEGER NOT NULL DEFAULT 0,
              cleared_at_ms INTEGER,
              cleared_by TEXT,
              prev_hash BLOB NOT NULL,
              entry_hash BLOB NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_violations_session
              ON violations(exam_id, student_id, ts_ms);
            CREATE INDEX IF NOT EXISTS idx_violations_passkey ON violations(passkey);

            CREATE TRIGGER IF NOT EXISTS violations_append_only
            BEFORE DELETE ON violations
            BEGIN
              SELECT RAISE(ABORT, 'violation records are append-only');
            END;

            DROP TRIGGER IF EXISTS violations_clear_once;
            CREATE TRIGGER IF NOT EXISTS violations_clearance_final
            BEFORE UPDATE OF cleared, cleared_at_ms, cleared_by ON violations
            WHEN OLD.cleared = 1
            BEGIN
              SELECT RAISE(ABORT, 'cleared violations are final');
            END;

            CREATE TRIGGER IF NOT EXISTS violations_fixed_fields
            BEFORE UPDATE OF exam_id, student_id, ts_ms, reason, passkey, prev_hash, entry_hash
            ON violations
            BEGIN
              SELECT RAISE(ABORT, 'violation fields are immutable');
            END;
            "#,
        )?;
        Ok(())
    }

    fn last_entry_hash(conn: &Connection) -> Result<[u8; 32]> {
        let bytes: Option<Vec<u8>> = conn
            .query_row(
                "SELECT entry_hash FROM violations ORDER BY id DESC LIMIT 1",
                [],
                |row| row.get(0),
            )
            .optional()?;
        match bytes {
            Some(bytes) => blob32(bytes, "entry_hash"),
            None => Ok([0u8; 32]),
        }
    }

    fn insert(conn: &Connection, record: &ViolationRecord, prev_hash: &[u8; 32]) -> Result<()> {
        conn.execute(
            r#"
            INSERT INTO violations(
              exam_id, student_id, ts_ms, reason, passkey,
              cleared, cleared_at_ms, cleared_by, prev_hash, entry_hash)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
            "#,
            params![
                record.exam_id(),
                record.student_id(),
                record.timestamp().timestamp_millis(),
                record.reason().tag(),
                record.passkey().as_str(),
                record.is_cleared(),
                record.cleared_at().map(|t| t.timestamp_millis()),
                record.cleared_by().map(|c| c.to_string()),
                prev_hash.to_vec(),
                record.entry_hash().to_vec(),
            ],
        )?;
        Ok(())
    }

    fn query_records<P: rusqlite::Params>(&self, sql: &str, params: P) -> Result<Vec<ViolationRecord>> {
        let mut stmt = self.conn.prepare(sql)?;
        let mut rows = stmt.query(params)?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            out.push(record_from_row(row)?);
        }
        Ok(out)
    }
}

fn record_from_row(row: &rusqlite::Row<'_>) -> Result<ViolationRecord> {
    let exam_id: String = row.get(0)?;
    let student_id: String = row.get(1)?;
    let ts_ms: i64 = row.get(2)?;
    let reason: String = row.get(3)?;
    let passkey: String = row.get(4)?;
    let cleared_at_ms: Option<i64> = row.get(5)?;
    let cleared_by: Option<String> = row.get(6)?;
    let entry_hash: Vec<u8> = row.get(7)?;

    Ok(ViolationRecord::from_parts(
        SessionKey {
            exam_id,
            student_id,
        },
        datetime_from_ms(ts_ms)?,
        reason.parse::<ViolationReason>()?,
        Passkey::parse(&passkey)?,
        cleared_at_ms.map(datetime_from_ms).transpose()?,
        cleared_by.map(|c| c.parse::<Clearance>()).transpose()?,
        blob32(entry_hash, "entry_hash")?,
    ))
}

fn blob32(bytes: Vec<u8>, context: &str) -> Result<[u8; 32]> {
    if bytes.len() != 32 {
        return Err(anyhow!("corrupt violation log: {} size", context));
    }
    let mut out = [0u8; 32];
    out.copy_from_slice(&bytes);
    Ok(out)
}

impl ViolationStore for SqliteViolationStore {
    fn record(&mut self, key: &SessionKey, reason: ViolationReason) -> Result<ViolationRecord> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;

        let outstanding: bool = tx.query_row(
            "SELECT EXISTS(SELECT 1 FROM violations WHERE exam_id = ?1 AND student_id = ?2 AND cleared = 0)",
            params![key.exam_id, key.student_id],
            |row| row.get(0),
        )?;
        if outstanding {
            return Err(anyhow!("violation already outstanding for {}", key));
        }

        let passkey = self.issuer.issue_unique(&mut |candidate| {
            let taken: bool = tx.query_row(
                "SELECT EXISTS(SELECT 1 FROM violations WHERE passkey = ?1 AND cleared = 0)",
                params![candidate.as_str()],
                |row| row.get(0),
            )?;
            Ok(taken)
        })?;

        let last_ms: Option<i64> =
            tx.query_row("SELECT MAX(ts_ms) FROM violations", [], |row| row.get(0))?;
        let timestamp = datetime_from_ms(next_timestamp_ms(last_ms))?;

        let prev_hash = Self::last_entry_hash(&tx)?;
        let mut record = ViolationRecord::new(key.clone(), timestamp, reason, passkey);
        record.set_entry_hash(chain_record(&prev_hash, &record)?);
        Self::insert(&tx, &record, &prev_hash)?;
        tx.commit()?;

        log::info!("violation recorded for {}: {}", key, record.reason().tag());
        Ok(record)
    }

    fn find_outstanding(&self, key: &SessionKey) -> Result<Option<ViolationRecord>> {
        let sql = format!(
            "SELECT {RECORD_COLUMNS} FROM violations
             WHERE exam_id = ?1 AND student_id = ?2 AND cleared = 0
             ORDER BY ts_ms DESC, id DESC LIMIT 1"
        );
        Ok(self
            .query_records(&sql, params![key.exam_id, key.student_id])?
            .into_iter()
            .next())
    }

    fn clear(&mut self, key: &SessionKey, passkey: &Passkey, by: &Clearance) -> Result<bool> {
        let changed = self.conn.execute(
            r#"
            UPDATE violations SET cleared = 1, cleared_at_ms = ?4, cleared_by = ?5
            WHERE exam_id = ?1 AND student_id = ?2 AND passkey = ?3 AND cleared = 0
            "#,
            params![
                key.exam_id,
                key.student_id,
                passkey.as_str(),
                now_ms(),
                by.to_string()
            ],
        )?;
        if changed > 0 {
            log::info!("violation cleared for {} by {}", key, by);
            return Ok(true);
        }
        let exists: bool = self.conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM violations WHERE exam_id = ?1 AND student_id = ?2 AND passkey = ?3)",
            params![key.exam_id, key.student_id, passkey.as_str()],
            |row| row.get(0),
        )?;
        Ok(exists)
    }

    fn list(&self, filter: &ViolationFilter) -> Result<Vec<ViolationRecord>> {
        let status_clause = match filter.status {
            StatusFilter::All => "",
            StatusFilter::Active => "WHERE cleared = 0",
            StatusFilter::Cleared => "WHERE cleared = 1",
        };
        let sql = format!(
            "SELECT {RECORD_COLUMNS} FROM violations {status_clause} ORDER BY ts_ms DESC, id DESC"
        );
        Ok(self
            .query_records(&sql, [])?
            .into_iter()
            .filter(|record| filter.matches(record))
            .collect())
    }

    fn records_for(&self, key: &SessionKey) -> Result<Vec<ViolationRecord>> {
        let sql = format!(
            "SELECT {RECORD_COLUMNS} FROM violations
             WHERE exam_id = ?1 AND student_id = ?2
             ORDER BY ts_ms DESC, id DESC"
        );
        self.query_records(&sql, params![key.exam_id, key.student_id])
    }

    fn find_by_passkey(&self, passkey: &Passkey) -> Result<Option<ViolationRecord>> {
        let sql = format!(
            "SELECT {RECORD_COLUMNS} FROM violations WHERE passkey = ?1
             ORDER BY ts_ms DESC, id DESC LIMIT 1"
        );
        Ok(self
            .query_records(&sql, params![passkey.as_str()])?
            .into_iter()
            .next())
    }

    fn import(&mut self, records: Vec<ViolationRecord>) -> Result<usize> {
        let records = validate_import(records)?;
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;
        let mut prev_hash = Self::last_entry_hash(&tx)?;
        for mut record in records.iter().cloned() {
            let entry_hash = chain_record(&prev_hash, &record)?;
            record.set_entry_hash(entry_hash);
            Self::insert(&tx, &record, &prev_hash)?;
            prev_hash = entry_hash;
        }
        let now = now_ms();
        for key in sessions_with_outstanding(&records) {
            let superseded = tx.execute(
                r#"
                UPDATE violations SET cleared = 1, cleared_at_ms = ?3, cleared_by = ?4
                WHERE exam_id = ?1 AND student_id = ?2 AND cleared = 0
                  AND id <> (SELECT id FROM violations
                             WHERE exam_id = ?1 AND student_id = ?2 AND cleared = 0
                             ORDER BY ts_ms DESC, id DESC LIMIT 1)
                "#,
                params![
                    key.exam_id,
                    key.student_id,
                    now,
                    Clearance::Superseded.to_string()
                ],
            )?;
            if superseded > 0 {
                log::warn!("{} older outstanding violations superseded for {}", superseded, key);
            }
        }
        tx.commit()?;
        log::info!("imported {} violation records", records.len());
        Ok(records.len())
    }

    fn audit_trail(&self) -> Result<Vec<ViolationRecord>> {
        let sql = format!("SELECT {RECORD_COLUMNS} FROM violations ORDER BY id ASC");
        self.query_records(&sql, [])
    }
}

// -------------------- In-Memory --------------------

pub struct InMemoryViolationStore {
    records: Vec<ViolationRecord>,
    issuer: Box<dyn TokenIssuer>,
}

impl InMemoryViolationStore {
    pub fn new() -> Self {
        Self::with_issuer(Box::new(OsTokenIssuer))
    }

    pub fn with_issuer(issuer: Box<dyn TokenIssuer>) -> Self {
        Self {
            records: Vec::new(),
            issuer,
        }
    }

    fn last_entry_hash(&self) -> [u8; 32] {
        self.records
            .last()
            .map(|record| record.entry_hash())
            .unwrap_or([0u8; 32])
    }

    /// Newest first; among equal timestamps the later insertion wins.
    fn newest_first(&self, keep: impl Fn(&ViolationRecord) -> bool) -> Vec<ViolationRecord> {
        let mut out: Vec<ViolationRecord> = self
            .records
            .iter()
            .rev()
            .filter(|r| keep(*r))
            .cloned()
            .collect();
        out.sort_by(|a, b| b.timestamp().cmp(&a.timestamp()));
        out
    }

    /// Clears every outstanding violation of `key` except the newest.
    fn supersede_older(&mut self, key: &SessionKey, now: DateTime<Utc>) {
        // Same ordering as `newest_first`: timestamp, then insertion.
        let Some(newest) = self
            .records
            .iter()
            .enumerate()
            .filter(|(_, r)| r.key() == key && !r.is_cleared())
            .max_by_key(|(i, r)| (r.timestamp(), *i))
            .map(|(i, _)| i)
        else {
            return;
        };
        let mut superseded = 0;
        for (i, record) in self.records.iter_mut().enumerate() {
            if i != newest && record.key() == key && !record.is_cleared() {
                record.mark_cleared(now, Clearance::Superseded);
                superseded += 1;
            }
        }
        if superseded > 0 {
            log::warn!("{} older outstanding violations superseded for {}", superseded, key);
        }
    }
}

impl Default for InMemoryViolationStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ViolationStore for InMemoryViolationStore {
    fn record(&mut self, key: &SessionKey, reason: ViolationReason) -> Result<ViolationRecord> {
        if self
            .records
            .iter()
            .any(|r| r.key() == key && !r.is_cleared())
        {
            return Err(anyhow!("violation already outstanding for {}", key));
        }

        let records = &self.records;
        let passkey = self.issuer.issue_unique(&mut |candidate| {
            Ok(records
                .iter()
                .any(|r| !r.is_cleared() && r.passkey() == candidate))
        })?;

        let last_ms = self
            .records
            .iter()
            .map(|r| r.timestamp().timestamp_millis())
            .max();
        let timestamp = datetime_from_ms(next_timestamp_ms(last_ms))?;

        let prev_hash = self.last_entry_hash();
        let mut record = ViolationRecord::new(key.clone(), timestamp, reason, passkey);
        record.set_entry_hash(chain_record(&prev_hash, &record)?);
        self.records.push(record.clone());

        log::info!("violation recorded for {}: {}", key, record.reason().tag());
        Ok(record)
    }

    fn find_outstanding(&self, key: &SessionKey) -> Result<Option<ViolationRecord>> {
        Ok(self
            .newest_first(|r| r.key() == key && !r.is_cleared())
            .into_iter()
            .next())
    }

    fn clear(&mut self, key: &SessionKey, passkey: &Passkey, by: &Clearance) -> Result<bool> {
        let now = datetime_from_ms(now_ms())?;
        let mut found = false;
        for record in self
            .records
            .iter_mut()
            .filter(|r| r.key() == key && r.passkey() == passkey)
        {
            if !record.is_cleared() {
                record.mark_cleared(now, by.clone());
                log::info!("violation cleared for {} by {}", key, by);
            }
            found = true;
        }
        Ok(found)
    }

    fn list(&self, filter: &ViolationFilter) -> Result<Vec<ViolationRecord>> {
        Ok(self.newest_first(|r| filter.matches(r)))
    }

    fn records_for(&self, key: &SessionKey) -> Result<Vec<ViolationRecord>> {
        Ok(self.newest_first(|r| r.key() == key))
    }

    fn find_by_passkey(&self, passkey: &Passkey) -> Result<Option<ViolationRecord>> {
        Ok(self
            .newest_first(|r| r.passkey() == passkey)
            .into_iter()
            .next())
    }

    fn import(&mut self, records: Vec<ViolationRecord>) -> Result<usize> {
        let records = validate_import(records)?;
        let count = records.len();
        let sessions = sessions_with_outstanding(&records);
        let mut prev_hash = self.last_entry_hash();
        for mut record in records {
            prev_hash = chain_record(&prev_hash, &record)?;
            record.set_entry_hash(prev_hash);
            self.records.push(record);
        }
        let now = datetime_from_ms(now_ms())?;
        for key in sessions {
            self.supersede_older(&key, now);
        }
        Ok(count)
    }

    fn audit_trail(&self) -> Result<Vec<ViolationRecord>> {
        Ok(self.records.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::passkey::FixedTokenIssuer;
    use crate::verify_chain;

    fn key(exam: &str, student: &str) -> SessionKey {
        SessionKey::new(exam, student).unwrap()
    }

    fn legacy(exam: &str, student: &str, ts: &str, passkey: &str, cleared: bool) -> ViolationRecord {
        let cleared_at = if cleared {
            format!("\"{ts}\"")
        } else {
            "null".to_string()
        };
        serde_json::from_str(&format!(
            r#"{{"examId":"{exam}","studentId":"{student}","timestamp":"{ts}",
                "reason":"TabHidden","passkey":"{passkey}",
                "cleared":{cleared},"clearedAt":{cleared_at}}}"#
        ))
        .unwrap()
    }

    #[test]
    fn record_refuses_a_second_outstanding_violation() {
        let mut store = InMemoryViolationStore::new();
        let k = key("exam-1", "student-1");
        let first = store.record(&k, ViolationReason::TabHidden).unwrap();
        assert!(!first.is_cleared());
        assert!(store.record(&k, ViolationReason::FullscreenExited).is_err());
        assert_eq!(store.records_for(&k).unwrap().len(), 1);

        assert!(store.clear(&k, first.passkey(), &Clearance::Passkey).unwrap());
        assert!(store.record(&k, ViolationReason::FullscreenExited).is_ok());
        assert_eq!(store.records_for(&k).unwrap().len(), 2);
    }

    #[test]
    fn timestamps_strictly_increase() {
        let mut store = InMemoryViolationStore::new();
        let mut last = None;
        for i in 0..20 {
            let k = key("exam-1", &format!("student-{i}"));
            let ts = store.record(&k, ViolationReason::TabHidden).unwrap().timestamp();
            if let Some(prev) = last {
                assert!(ts > prev);
            }
            last = Some(ts);
        }
    }

    #[test]
    fn clear_is_idempotent_and_final() {
        let mut store = InMemoryViolationStore::new();
        let k = key("exam-1", "student-1");
        let rec = store.record(&k, ViolationReason::TabHidden).unwrap();

        assert!(store.clear(&k, rec.passkey(), &Clearance::Staff("ana".into())).unwrap());
        let cleared = store.find_by_passkey(rec.passkey()).unwrap().unwrap();
        let at = cleared.cleared_at().unwrap();
        assert!(store.clear(&k, rec.passkey(), &Clearance::Passkey).unwrap());
        let again = store.find_by_passkey(rec.passkey()).unwrap().unwrap();
        assert_eq!(again.cleared_at(), Some(at));
        assert_eq!(again.cleared_by(), Some(&Clearance::Staff("ana".into())));
        assert!(store.find_outstanding(&k).unwrap().is_none());
    }

    #[test]
    fn clear_requires_the_full_triple() {
        let mut store = InMemoryViolationStore::new();
        let k = key("exam-1", "student-1");
        let rec = store.record(&k, ViolationReason::TabHidden).unwrap();
        let other = key("exam-1", "student-2");
        assert!(!store.clear(&other, rec.passkey(), &Clearance::Passkey).unwrap());
        let wrong = Passkey::parse("ZZZZ-ZZZZ-ZZZZ").unwrap();
        assert!(!store.clear(&k, &wrong, &Clearance::Passkey).unwrap());
        assert!(store.find_outstanding(&k).unwrap().is_some());
    }

    #[test]
    fn issuance_avoids_outstanding_passkeys() {
        let issuer = FixedTokenIssuer::new(["AAAA-AAAA-AAAA", "AAAA-AAAA-AAAA", "BBBB-BBBB-BBBB"])
            .unwrap();
        let mut store = InMemoryViolationStore::with_issuer(Box::new(issuer));
        let a = store.record(&key("e", "s1"), ViolationReason::TabHidden).unwrap();
        let b = store.record(&key("e", "s2"), ViolationReason::TabHidden).unwrap();
        assert_eq!(a.passkey().as_str(), "AAAA-AAAA-AAAA");
        assert_eq!(b.passkey().as_str(), "BBBB-BBBB-BBBB");
    }

    #[test]
    fn list_filters_and_sorts_newest_first() {
        let mut store = InMemoryViolationStore::new();
        store
            .import(vec![
                legacy("exam-a", "s1", "2024-05-01T08:00:00.000Z", "AAAA-AAAA-AAAA", true),
                legacy("exam-b", "s2", "2024-05-10T08:00:00.000Z", "BBBB-BBBB-BBBB", false),
                legacy("exam-a", "s3", "2024-05-10T07:00:00.000Z", "CCCC-CCCC-CCCC", false),
            ])
            .unwrap();
        let as_of = "2024-05-10T12:00:00Z".parse::<DateTime<Utc>>().unwrap();

        let all = store.list(&ViolationFilter::new().as_of(as_of)).unwrap();
        let keys: Vec<&str> = all.iter().map(|r| r.passkey().as_str()).collect();
        assert_eq!(keys, ["BBBB-BBBB-BBBB", "CCCC-CCCC-CCCC", "AAAA-AAAA-AAAA"]);

        let active = store
            .list(&ViolationFilter::new().status(StatusFilter::Active).as_of(as_of))
            .unwrap();
        assert_eq!(active.len(), 2);

        let cleared = store
            .list(&ViolationFilter::new().status(StatusFilter::Cleared).as_of(as_of))
            .unwrap();
        assert_eq!(cleared.len(), 1);

        let today = store
            .list(&ViolationFilter::new().window(TimeWindow::Today).as_of(as_of))
            .unwrap();
        assert_eq!(today.len(), 2);

        let week = store
            .list(&ViolationFilter::new().window(TimeWindow::Week).as_of(as_of))
            .unwrap();
        assert_eq!(week.len(), 2);

        let search = store
            .list(&ViolationFilter::new().search("EXAM-A").as_of(as_of))
            .unwrap();
        assert_eq!(search.len(), 2);

        let by_reason = store
            .list(&ViolationFilter::new().search("minimized").as_of(as_of))
            .unwrap();
        assert_eq!(by_reason.len(), 3);

        let by_passkey = store
            .list(&ViolationFilter::new().search("cccc").as_of(as_of))
            .unwrap();
        assert_eq!(by_passkey.len(), 1);
    }

    #[test]
    fn import_rejects_inconsistent_clearance() {
        let mut store = InMemoryViolationStore::new();
        let record: ViolationRecord = serde_json::from_str(
            r#"{"examId":"e","studentId":"s","timestamp":"2024-05-01T08:00:00.000Z",
                "reason":"TabHidden","passkey":"AAAA-AAAA-AAAA","cleared":true,"clearedAt":null}"#,
        )
        .unwrap();
        assert!(store.import(vec![record]).is_err());
        assert!(store.audit_trail().unwrap().is_empty());
    }

    #[test]
    fn import_keeps_only_the_newest_outstanding_violation() {
        let mut store = InMemoryViolationStore::new();
        let k = key("exam-1", "student-1");
        store
            .import(vec![
                legacy("exam-1", "student-1", "2024-06-01T10:10:00.000Z", "BBBB-BBBB-BBBB", false),
                legacy("exam-1", "student-1", "2024-06-01T10:00:00.000Z", "AAAA-AAAA-AAAA", false),
            ])
            .unwrap();

        let outstanding = store.find_outstanding(&k).unwrap().unwrap();
        assert_eq!(outstanding.passkey().as_str(), "BBBB-BBBB-BBBB");
        let older = store
            .find_by_passkey(&Passkey::parse("AAAA-AAAA-AAAA").unwrap())
            .unwrap()
            .unwrap();
        assert!(older.is_cleared());
        assert_eq!(older.cleared_by(), Some(&Clearance::Superseded));
        assert!(older.cleared_at().is_some());

        assert!(store.clear(&k, outstanding.passkey(), &Clearance::Passkey).unwrap());
        assert!(store.find_outstanding(&k).unwrap().is_none());
        assert_eq!(verify_chain(&store.audit_trail().unwrap()).unwrap(), None);
    }

    #[test]
    fn import_supersedes_an_older_outstanding_row_already_in_the_log() {
        let mut store = InMemoryViolationStore::with_issuer(Box::new(
            FixedTokenIssuer::new(["AAAA-AAAA-AAAA"]).unwrap(),
        ));
        let k = key("exam-1", "student-1");
        let live = store.record(&k, ViolationReason::FullscreenExited).unwrap();

        // An older backlog entry does not displace the live lock.
        store
            .import(vec![legacy("exam-1", "student-1", "2024-06-01T10:00:00.000Z", "CCCC-CCCC-CCCC", false)])
            .unwrap();
        assert_eq!(store.find_outstanding(&k).unwrap().unwrap().passkey(), live.passkey());
        assert_eq!(
            store.list(&ViolationFilter::new().status(StatusFilter::Active)).unwrap().len(),
            1
        );

        // A newer one does.
        store
            .import(vec![legacy("exam-1", "student-1", "2999-01-01T00:00:00.000Z", "DDDD-DDDD-DDDD", false)])
            .unwrap();
        assert_eq!(
            store.find_outstanding(&k).unwrap().unwrap().passkey().as_str(),
            "DDDD-DDDD-DDDD"
        );
        let displaced = store.find_by_passkey(live.passkey()).unwrap().unwrap();
        assert_eq!(displaced.cleared_by(), Some(&Clearance::Superseded));
    }

    #[test]
    fn audit_trail_chains_recorded_and_imported_entries() {
        let mut store = InMemoryViolationStore::new();
        store
            .import(vec![legacy("e", "s1", "2024-05-01T08:00:00.000Z", "AAAA-AAAA-AAAA", false)])
            .unwrap();
        let rec = store.record(&key("e", "s2"), ViolationReason::TabHidden).unwrap();
        store.clear(rec.key(), rec.passkey(), &Clearance::Passkey).unwrap();
        assert_eq!(verify_chain(&store.audit_trail().unwrap()).unwrap(), None);
    }

    #[test]
    fn filter_parsers_accept_console_parameters() {
        assert_eq!("active".parse::<StatusFilter>().unwrap(), StatusFilter::Active);
        assert_eq!("Cleared".parse::<StatusFilter>().unwrap(), StatusFilter::Cleared);
        assert_eq!("week".parse::<TimeWindow>().unwrap(), TimeWindow::Week);
        assert!("month".parse::<TimeWindow>().is_err());
    }
}
