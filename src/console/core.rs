//! Staff recovery surface (no CLI).

use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::authority::PasskeyAuthority;
use crate::passkey::Passkey;
use crate::storage::{ViolationFilter, ViolationStore};
use crate::{Clearance, SessionKey, ViolationReason, ViolationRecord};

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct StaffId(pub String);

impl StaffId {
    pub fn new(id: &str) -> Result<Self> {
        let id = id.trim();
        if id.is_empty() {
            return Err(anyhow!("staff id cannot be empty"));
        }
        Ok(Self(id.to_string()))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ClearOutcome {
    Cleared,
    AlreadyCleared,
    NotFound,
}

/// Whether a session is currently held by a violation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "camelCase")]
pub enum LockState {
    Unlocked,
    Locked {
        reason: ViolationReason,
        timestamp: DateTime<Utc>,
    },
}

pub fn lock_state(store: &dyn ViolationStore, key: &SessionKey) -> Result<LockState> {
    Ok(match store.find_outstanding(key)? {
        Some(record) => LockState::Locked {
            reason: record.reason().clone(),
            timestamp: record.timestamp(),
        },
        None => LockState::Unlocked,
    })
}

/// Read, search, and clear violations on behalf of a staff member.
pub struct RecoveryConsole<'a> {
    store: &'a mut dyn ViolationStore,
    staff: StaffId,
}

impl<'a> RecoveryConsole<'a> {
    pub fn new(store: &'a mut dyn ViolationStore, staff: StaffId) -> Self {
        Self { store, staff }
    }

    pub fn staff(&self) -> &StaffId {
        &self.staff
    }

    pub fn list(&self, filter: &ViolationFilter) -> Result<Vec<ViolationRecord>> {
        self.store.list(filter)
    }

    pub fn detail(&self, key: &SessionKey, passkey: &Passkey) -> Result<Option<ViolationRecord>> {
        Ok(self
            .store
            .records_for(key)?
            .into_iter()
            .find(|record| record.passkey() == passkey))
    }

    /// Clears a violation on staff authority. The passkey still has to name
    /// the record, but the student does not have to present it.
    pub fn clear(&mut self, key: &SessionKey, passkey: &Passkey) -> Result<ClearOutcome> {
        let Some(record) = self.detail(key, passkey)? else {
            return Ok(ClearOutcome::NotFound);
        };
        if record.is_cleared() {
            return Ok(ClearOutcome::AlreadyCleared);
        }
        let by = Clearance::Staff(self.staff.0.clone());
        if self.store.clear(key, passkey, &by)? {
            Ok(ClearOutcome::Cleared)
        } else {
            Ok(ClearOutcome::NotFound)
        }
    }

    /// Manual lookup for a passkey read out by a student.
    pub fn find_by_passkey(&self, input: &str) -> Result<Option<ViolationRecord>> {
        let passkey = Passkey::parse(input)?;
        self.store.find_by_passkey(&passkey)
    }

    pub fn verify(&self, key: &SessionKey, passkey: &Passkey) -> Result<bool> {
        PasskeyAuthority::default().verify(&*self.store, key, passkey)
    }

    pub fn lock_state(&self, key: &SessionKey) -> Result<LockState> {
        lock_state(&*self.store, key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::passkey::FixedTokenIssuer;
    use crate::storage::{InMemoryViolationStore, StatusFilter};

    fn key() -> SessionKey {
        SessionKey::new("exam-1", "student-1").unwrap()
    }

    fn store() -> InMemoryViolationStore {
        let issuer = FixedTokenIssuer::new(["XQ7T-PLM4-9VKR", "BBBB-BBBB-BBBB"]).unwrap();
        InMemoryViolationStore::with_issuer(Box::new(issuer))
    }

    #[test]
    fn staff_clear_is_attributed_and_idempotent() {
        let mut store = store();
        let record = store.record(&key(), ViolationReason::TabHidden).unwrap();
        let mut console = RecoveryConsole::new(&mut store, StaffId::new("proctor-7").unwrap());

        assert!(matches!(console.lock_state(&key()).unwrap(), LockState::Locked { .. }));
        assert_eq!(
            console.clear(&key(), record.passkey()).unwrap(),
            ClearOutcome::Cleared
        );
        assert_eq!(
            console.clear(&key(), record.passkey()).unwrap(),
            ClearOutcome::AlreadyCleared
        );
        assert_eq!(console.lock_state(&key()).unwrap(), LockState::Unlocked);

        let detail = console.detail(&key(), record.passkey()).unwrap().unwrap();
        assert_eq!(
            detail.cleared_by(),
            Some(&Clearance::Staff("proctor-7".to_string()))
        );
    }

    #[test]
    fn clear_of_unknown_violation_is_not_found() {
        let mut store = store();
        store.record(&key(), ViolationReason::TabHidden).unwrap();
        let mut console = RecoveryConsole::new(&mut store, StaffId::new("p").unwrap());
        let wrong = Passkey::parse("ZZZZ-ZZZZ-ZZZZ").unwrap();
        assert_eq!(console.clear(&key(), &wrong).unwrap(), ClearOutcome::NotFound);
        let active = console
            .list(&ViolationFilter::new().status(StatusFilter::Active))
            .unwrap();
        assert_eq!(active.len(), 1);
    }

    #[test]
    fn lookup_normalizes_spoken_passkeys() {
        let mut store = store();
        store.record(&key(), ViolationReason::FullscreenExited).unwrap();
        let console = RecoveryConsole::new(&mut store, StaffId::new("p").unwrap());
        let found = console.find_by_passkey("xq7t plm4 9vkr").unwrap().unwrap();
        assert_eq!(found.key(), &key());
        assert!(console.find_by_passkey("ZZZZZZZZZZZZ").unwrap().is_none());
        assert!(console.find_by_passkey("xq7t").is_err());
    }

    #[test]
    fn verify_panel_uses_latest_record() {
        let mut store = store();
        let first = store.record(&key(), ViolationReason::TabHidden).unwrap();
        store.clear(&key(), first.passkey(), &Clearance::Passkey).unwrap();
        let second = store.record(&key(), ViolationReason::TabHidden).unwrap();
        let console = RecoveryConsole::new(&mut store, StaffId::new("p").unwrap());
        assert!(console.verify(&key(), second.passkey()).unwrap());
        assert!(!console.verify(&key(), first.passkey()).unwrap());
    }

    #[test]
    fn lock_state_json() {
        let store = InMemoryViolationStore::new();
        let value = serde_json::to_value(lock_state(&store, &key()).unwrap()).unwrap();
        assert_eq!(value["state"], "unlocked");
        assert!(StaffId::new("  ").is_err());
    }
}
