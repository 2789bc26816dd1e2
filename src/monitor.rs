//! Session integrity monitor.
//!
//! The monitor is a caller-driven state machine. Integrity signals arrive
//! through a [`SignalSource`]; each [`SessionMonitor::pump`] consumes one
//! tick of signals, and [`SessionMonitor::advance`] moves the exam clock.
//! Persistence goes through the [`ViolationStore`] passed into each call, so
//! the monitor never holds the log and the log never points back at the
//! monitor.

use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::time::Duration;

use crate::passkey::Passkey;
use crate::storage::ViolationStore;
use crate::{SessionKey, ViolationReason, ViolationRecord};

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(30);
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(30 * 60);

// -------------------- Signals --------------------

/// A key press as observed by the exam client.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct KeyChord {
    pub key: String,
    pub alt: bool,
    pub ctrl: bool,
    /// Command on macOS, the Windows key elsewhere.
    pub meta: bool,
    pub shift: bool,
}

impl KeyChord {
    pub fn new(key: &str) -> Self {
        Self {
            key: key.to_string(),
            ..Self::default()
        }
    }

    pub fn alt(mut self) -> Self {
        self.alt = true;
        self
    }

    pub fn ctrl(mut self) -> Self {
        self.ctrl = true;
        self
    }

    pub fn meta(mut self) -> Self {
        self.meta = true;
        self
    }

    pub fn shift(mut self) -> Self {
        self.shift = true;
        self
    }

    /// Chords that leave the exam, close it, capture it, or open devtools.
    pub fn is_forbidden(&self) -> bool {
        let key = self.key.as_str();
        let letter = key.to_ascii_lowercase();
        match key {
            "F11" | "F12" | "Escape" | "PrintScreen" => return true,
            "Tab" => return self.alt || self.meta,
            "F4" => return self.alt,
            _ => {}
        }
        match letter.as_str() {
            "w" => self.meta,
            "p" => self.ctrl || self.meta,
            "i" => (self.ctrl && self.shift) || (self.meta && self.alt),
            _ => false,
        }
    }

    /// Human form, modifiers first: `Alt+Tab`, `Ctrl+Shift+I`.
    pub fn describe(&self) -> String {
        let mut out = String::new();
        for (held, name) in [
            (self.alt, "Alt+"),
            (self.ctrl, "Ctrl+"),
            (self.meta, "Command+"),
            (self.shift, "Shift+"),
        ] {
            if held {
                out.push_str(name);
            }
        }
        out.push_str(&self.key);
        out
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "signal", rename_all = "camelCase")]
pub enum IntegritySignal {
    /// Full-screen mode could not be entered at session start.
    FullscreenAcquireFailed,
    FullscreenChanged { active: bool },
    VisibilityChanged { hidden: bool },
    KeyDown(KeyChord),
}

impl IntegritySignal {
    /// The violation this signal constitutes, if any.
    pub fn violation(&self) -> Option<ViolationReason> {
        match self {
            Self::FullscreenAcquireFailed => Some(ViolationReason::FullscreenExitFailed),
            Self::FullscreenChanged { active: false } => Some(ViolationReason::FullscreenExited),
            Self::VisibilityChanged { hidden: true } => Some(ViolationReason::TabHidden),
            Self::KeyDown(chord) if chord.is_forbidden() => {
                Some(ViolationReason::ForbiddenKeyCombo(chord.describe()))
            }
            _ => None,
        }
    }
}

/// Where the monitor reads integrity signals from.
pub trait SignalSource {
    /// Signals observed since the previous call; one event-loop tick.
    fn drain(&mut self) -> Vec<IntegritySignal>;

    /// Stops observation. Called once, when the session is submitted.
    fn release(&mut self) {}
}

/// Signal source fed from a prepared list of ticks.
#[derive(Clone, Debug, Default)]
pub struct ScriptedSignals {
    ticks: VecDeque<Vec<IntegritySignal>>,
    released: bool,
}

impl ScriptedSignals {
    pub fn new<I>(ticks: I) -> Self
    where
        I: IntoIterator<Item = Vec<IntegritySignal>>,
    {
        Self {
            ticks: ticks.into_iter().collect(),
            released: false,
        }
    }

    pub fn push_tick(&mut self, tick: Vec<IntegritySignal>) {
        self.ticks.push_back(tick);
    }

    pub fn pending_ticks(&self) -> usize {
        self.ticks.len()
    }

    pub fn is_released(&self) -> bool {
        self.released
    }
}

impl SignalSource for ScriptedSignals {
    fn drain(&mut self) -> Vec<IntegritySignal> {
        if self.released {
            return Vec::new();
        }
        self.ticks.pop_front().unwrap_or_default()
    }

    fn release(&mut self) {
        self.released = true;
        self.ticks.clear();
    }
}

// -------------------- Monitor --------------------

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MonitorSettings {
    pub poll_interval: Duration,
    /// Longest a session may stay locked before it is submitted. `None`
    /// leaves it locked until cleared.
    pub lock_timeout: Option<Duration>,
}

impl Default for MonitorSettings {
    fn default() -> Self {
        Self {
            poll_interval: DEFAULT_POLL_INTERVAL,
            lock_timeout: Some(DEFAULT_LOCK_TIMEOUT),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum SessionState {
    Active,
    Locked,
    Submitted,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum SubmitCause {
    Manual,
    /// The exam clock reached zero.
    Timeout,
    /// The session stayed locked longer than the lock timeout.
    LockTimeout,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmissionReceipt {
    #[serde(flatten)]
    pub key: SessionKey,
    pub answers: BTreeMap<String, String>,
    pub time_spent_secs: u64,
    pub cause: SubmitCause,
    pub submitted_at: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MonitorEvent {
    /// A violation was recorded. The passkey is for the student's eyes.
    Locked {
        reason: ViolationReason,
        passkey: Passkey,
    },
    Resumed {
        remaining: Duration,
    },
    Submitted(SubmissionReceipt),
}

pub struct SessionMonitor<S: SignalSource> {
    key: SessionKey,
    signals: S,
    settings: MonitorSettings,
    state: SessionState,
    duration: Duration,
    remaining: Duration,
    answers: BTreeMap<String, String>,
    outstanding: Option<ViolationRecord>,
    locked_for: Duration,
    since_poll: Duration,
    receipt: Option<SubmissionReceipt>,
}

impl<S: SignalSource> SessionMonitor<S> {
    /// Starts monitoring a session with `duration` on the clock. A session
    /// that already has an outstanding violation starts out locked.
    pub fn open(
        store: &dyn ViolationStore,
        key: SessionKey,
        duration: Duration,
        signals: S,
        settings: MonitorSettings,
    ) -> Result<Self> {
        if duration.is_zero() {
            return Err(anyhow!("exam duration must be positive"));
        }
        if settings.poll_interval.is_zero() {
            return Err(anyhow!("poll interval must be positive"));
        }
        let outstanding = store.find_outstanding(&key)?;
        let state = if outstanding.is_some() {
            log::info!("session {} opened locked", key);
            SessionState::Locked
        } else {
            SessionState::Active
        };
        Ok(Self {
            key,
            signals,
            settings,
            state,
            duration,
            remaining: duration,
            answers: BTreeMap::new(),
            outstanding,
            locked_for: Duration::ZERO,
            since_poll: Duration::ZERO,
            receipt: None,
        })
    }

    pub fn key(&self) -> &SessionKey {
        &self.key
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn remaining(&self) -> Duration {
        self.remaining
    }

    pub fn locked_for(&self) -> Duration {
        self.locked_for
    }

    pub fn answers(&self) -> &BTreeMap<String, String> {
        &self.answers
    }

    /// The violation holding the session locked.
    pub fn outstanding(&self) -> Option<&ViolationRecord> {
        match self.state {
            SessionState::Locked => self.outstanding.as_ref(),
            _ => None,
        }
    }

    pub fn receipt(&self) -> Option<&SubmissionReceipt> {
        self.receipt.as_ref()
    }

    pub fn signals(&self) -> &S {
        &self.signals
    }

    pub fn signals_mut(&mut self) -> &mut S {
        &mut self.signals
    }

    /// Whether the client should swallow this key press. Forbidden chords
    /// are suppressed for the whole life of the session, locked or not.
    pub fn should_suppress(&self, chord: &KeyChord) -> bool {
        self.state != SessionState::Submitted && chord.is_forbidden()
    }

    /// Processes one tick from the signal source.
    pub fn pump(&mut self, store: &mut dyn ViolationStore) -> Result<Vec<MonitorEvent>> {
        if self.state == SessionState::Submitted {
            return Ok(Vec::new());
        }
        let tick = self.signals.drain();
        Ok(self.handle_tick(store, tick)?.into_iter().collect())
    }

    /// Processes a single signal as its own tick.
    pub fn observe(
        &mut self,
        store: &mut dyn ViolationStore,
        signal: IntegritySignal,
    ) -> Result<Option<MonitorEvent>> {
        self.handle_tick(store, vec![signal])
    }

    fn handle_tick(
        &mut self,
        store: &mut dyn ViolationStore,
        tick: Vec<IntegritySignal>,
    ) -> Result<Option<MonitorEvent>> {
        if self.state != SessionState::Active {
            if !tick.is_empty() {
                log::debug!("{} signals ignored for {} while {:?}", tick.len(), self.key, self.state);
            }
            return Ok(None);
        }

        let Some(reason) = tick
            .iter()
            .filter_map(IntegritySignal::violation)
            .min_by_key(ViolationReason::specificity)
        else {
            return Ok(None);
        };

        // Another tab may already hold the lock; share it rather than mint a
        // second passkey.
        if let Some(existing) = store.find_outstanding(&self.key)? {
            return Ok(Some(self.adopt_lock(existing)));
        }
        let record = match store.record(&self.key, reason) {
            Ok(record) => record,
            Err(err) => match store.find_outstanding(&self.key)? {
                Some(existing) => return Ok(Some(self.adopt_lock(existing))),
                None => return Err(err),
            },
        };
        log::warn!("session {} locked: {}", self.key, record.reason().tag());
        Ok(Some(self.enter_locked(record)))
    }

    fn adopt_lock(&mut self, record: ViolationRecord) -> MonitorEvent {
        log::warn!(
            "session {} already locked elsewhere: {}",
            self.key,
            record.reason().tag()
        );
        self.enter_locked(record)
    }

    fn enter_locked(&mut self, record: ViolationRecord) -> MonitorEvent {
        self.state = SessionState::Locked;
        self.locked_for = Duration::ZERO;
        self.since_poll = Duration::ZERO;
        let event = MonitorEvent::Locked {
            reason: record.reason().clone(),
            passkey: record.passkey().clone(),
        };
        self.outstanding = Some(record);
        event
    }

    /// Moves wall time forward. The exam clock only runs while active.
    /// Every poll interval the store is checked: an active session picks up
    /// a lock recorded elsewhere, a locked one picks up its clearance.
    pub fn advance(
        &mut self,
        store: &mut dyn ViolationStore,
        elapsed: Duration,
    ) -> Result<Vec<MonitorEvent>> {
        let mut events = Vec::new();
        match self.state {
            SessionState::Submitted => {}
            SessionState::Active => {
                self.remaining = self.remaining.saturating_sub(elapsed);
                if self.remaining.is_zero() {
                    log::info!("exam time expired for {}", self.key);
                    events.push(MonitorEvent::Submitted(self.finish(SubmitCause::Timeout)));
                    return Ok(events);
                }
                self.since_poll += elapsed;
                if self.since_poll >= self.settings.poll_interval {
                    self.since_poll = Duration::ZERO;
                    events.extend(self.refresh(store)?);
                }
            }
            SessionState::Locked => {
                self.locked_for += elapsed;
                self.since_poll += elapsed;
                if self.since_poll >= self.settings.poll_interval {
                    self.since_poll = Duration::ZERO;
                    if let Some(event) = self.refresh(store)? {
                        events.push(event);
                        return Ok(events);
                    }
                }
                if let Some(limit) = self.settings.lock_timeout {
                    if self.locked_for >= limit {
                        log::warn!("session {} exceeded the lock timeout", self.key);
                        events.push(MonitorEvent::Submitted(self.finish(SubmitCause::LockTimeout)));
                    }
                }
            }
        }
        Ok(events)
    }

    /// Brings the session in line with the store. An active session with an
    /// outstanding violation locks on it; a locked session with none left
    /// resumes with the clock where it stopped.
    pub fn refresh(&mut self, store: &dyn ViolationStore) -> Result<Option<MonitorEvent>> {
        if self.state == SessionState::Submitted {
            return Ok(None);
        }
        let outstanding = store.find_outstanding(&self.key)?;
        match (self.state, outstanding) {
            (SessionState::Active, Some(record)) => Ok(Some(self.adopt_lock(record))),
            (SessionState::Active, None) => Ok(None),
            (_, Some(record)) => {
                self.outstanding = Some(record);
                Ok(None)
            }
            (_, None) => {
                self.state = SessionState::Active;
                self.outstanding = None;
                self.locked_for = Duration::ZERO;
                self.since_poll = Duration::ZERO;
                log::info!("session {} resumed", self.key);
                Ok(Some(MonitorEvent::Resumed {
                    remaining: self.remaining,
                }))
            }
        }
    }

    pub fn select_answer(&mut self, question: &str, option: &str) -> Result<()> {
        if self.state != SessionState::Active {
            return Err(anyhow!("answers can only change while the session is active"));
        }
        self.answers.insert(question.to_string(), option.to_string());
        Ok(())
    }

    /// Explicit submission, allowed while active or locked.
    pub fn submit(&mut self) -> Result<SubmissionReceipt> {
        if self.state == SessionState::Submitted {
            return Err(anyhow!("session {} already submitted", self.key));
        }
        Ok(self.finish(SubmitCause::Manual))
    }

    fn finish(&mut self, cause: SubmitCause) -> SubmissionReceipt {
        self.state = SessionState::Submitted;
        self.signals.release();
        let receipt = SubmissionReceipt {
            key: self.key.clone(),
            answers: self.answers.clone(),
            time_spent_secs: self.duration.saturating_sub(self.remaining).as_secs(),
            cause,
            submitted_at: Utc::now(),
        };
        log::info!("session {} submitted ({:?})", self.key, cause);
        self.receipt = Some(receipt.clone());
        receipt
    }
}
