//! Passkey verification and the student redemption path.

use anyhow::Result;
use std::collections::HashMap;

use crate::passkey::Passkey;
use crate::storage::ViolationStore;
use crate::{Clearance, SessionKey};

pub const DEFAULT_MAX_REDEEM_ATTEMPTS: u32 = 5;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RedeemOutcome {
    /// The violation was cleared; the session may resume.
    Resumed,
    /// The passkey matched a violation that is already cleared.
    AlreadyCleared,
    Rejected,
    /// Too many wrong passkeys for the current violation. Staff must clear it.
    AttemptsExhausted,
}

/// Checks presented passkeys against the violation log.
///
/// Only the most recent violation of a session is ever compared, so a
/// passkey from an older violation never unlocks a newer one.
pub struct PasskeyAuthority {
    max_attempts: u32,
    // Failed redemptions per session, tied to the passkey they were against.
    failures: HashMap<SessionKey, (Passkey, u32)>,
}

impl PasskeyAuthority {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            failures: HashMap::new(),
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// True when `passkey` equals the passkey of the session's latest
    /// violation, cleared or not. Never mutates the store.
    pub fn verify(
        &self,
        store: &dyn ViolationStore,
        key: &SessionKey,
        passkey: &Passkey,
    ) -> Result<bool> {
        let records = store.records_for(key)?;
        Ok(records
            .first()
            .map(|latest| latest.passkey() == passkey)
            .unwrap_or(false))
    }

    /// Student path: normalize `input`, verify it, and clear the violation.
    pub fn redeem(
        &mut self,
        store: &mut dyn ViolationStore,
        key: &SessionKey,
        input: &str,
    ) -> Result<RedeemOutcome> {
        let records = store.records_for(key)?;
        let Some(latest) = records.first() else {
            log::warn!("redemption for {} with no violation on record", key);
            return Ok(RedeemOutcome::Rejected);
        };

        if latest.is_cleared() {
            // Resolved elsewhere; nothing left to count against.
            self.failures.remove(key);
        } else if self.attempts_against(key, latest.passkey()) >= self.max_attempts {
            log::warn!("redemption attempts exhausted for {}", key);
            return Ok(RedeemOutcome::AttemptsExhausted);
        }

        let presented = Passkey::parse(input).ok();
        let matches = presented.as_ref() == Some(latest.passkey());
        if !matches {
            if !latest.is_cleared() {
                self.note_failure(key, latest.passkey());
            }
            log::warn!("rejected passkey for {}", key);
            return Ok(RedeemOutcome::Rejected);
        }

        if latest.is_cleared() {
            return Ok(RedeemOutcome::AlreadyCleared);
        }

        if store.clear(key, latest.passkey(), &Clearance::Passkey)? {
            self.failures.remove(key);
            log::info!("session {} recovered by passkey", key);
            Ok(RedeemOutcome::Resumed)
        } else {
            Ok(RedeemOutcome::Rejected)
        }
    }

    fn attempts_against(&self, key: &SessionKey, passkey: &Passkey) -> u32 {
        match self.failures.get(key) {
            Some((against, count)) if against == passkey => *count,
            _ => 0,
        }
    }

    fn note_failure(&mut self, key: &SessionKey, passkey: &Passkey) {
        let entry = self
            .failures
            .entry(key.clone())
            .or_insert_with(|| (passkey.clone(), 0));
        if &entry.0 != passkey {
            *entry = (passkey.clone(), 0);
        }
        entry.1 += 1;
    }
}

impl Default for PasskeyAuthority {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_REDEEM_ATTEMPTS)
    }
}
