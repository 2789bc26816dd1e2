use anyhow::Result;
use std::time::Duration;

use proctor_kernel::{
    shared_memory_uri, ClearOutcome, IntegritySignal, KeyChord, MonitorEvent, MonitorSettings,
    Passkey, PasskeyAuthority, RecoveryConsole, RedeemOutcome, ScriptedSignals, SessionKey,
    SessionMonitor, SessionState, SqliteViolationStore, StaffId, SubmitCause, ViolationReason,
    ViolationRecord, ViolationStore,
};

const EXAM: Duration = Duration::from_secs(45 * 60);

fn session() -> SessionKey {
    SessionKey::new("exam-42", "student-7").expect("session key")
}

fn open_monitor(
    store: &SqliteViolationStore,
    ticks: Vec<Vec<IntegritySignal>>,
) -> Result<SessionMonitor<ScriptedSignals>> {
    SessionMonitor::open(
        store,
        session(),
        EXAM,
        ScriptedSignals::new(ticks),
        MonitorSettings::default(),
    )
}

fn locked_passkey(events: &[MonitorEvent]) -> Passkey {
    match events {
        [MonitorEvent::Locked { passkey, .. }] => passkey.clone(),
        other => panic!("expected a single lock event, got {other:?}"),
    }
}

#[test]
fn staff_clear_from_console_resumes_the_student() -> Result<()> {
    let uri = shared_memory_uri();
    let mut student_store = SqliteViolationStore::open(&uri)?;
    let mut staff_store = SqliteViolationStore::open(&uri)?;

    let mut monitor = open_monitor(
        &student_store,
        vec![vec![IntegritySignal::FullscreenChanged { active: false }]],
    )?;
    monitor.advance(&mut student_store, Duration::from_secs(300))?;
    let passkey = locked_passkey(&monitor.pump(&mut student_store)?);
    let frozen = monitor.remaining();

    // The student reads the passkey to a proctor, who looks it up and clears it.
    {
        let mut console = RecoveryConsole::new(&mut staff_store, StaffId::new("proctor-1")?);
        let found = console
            .find_by_passkey(&passkey.as_str().to_lowercase())?
            .expect("lookup by passkey");
        assert_eq!(found.key(), &session());
        assert_eq!(found.reason(), &ViolationReason::FullscreenExited);
        assert!(console.verify(&session(), &passkey)?);
        assert_eq!(console.clear(&session(), &passkey)?, ClearOutcome::Cleared);
    }

    let events = monitor.advance(&mut student_store, Duration::from_secs(30))?;
    assert_eq!(events, vec![MonitorEvent::Resumed { remaining: frozen }]);
    assert_eq!(monitor.state(), SessionState::Active);
    Ok(())
}

#[test]
fn student_redemption_resumes_the_session() -> Result<()> {
    let mut store = SqliteViolationStore::open(&shared_memory_uri())?;
    let mut monitor = open_monitor(
        &store,
        vec![vec![IntegritySignal::KeyDown(KeyChord::new("Tab").alt())]],
    )?;
    let passkey = locked_passkey(&monitor.pump(&mut store)?);

    let mut authority = PasskeyAuthority::default();
    let spaced = passkey.as_str().replace('-', " ");
    assert_eq!(
        authority.redeem(&mut store, &session(), &spaced)?,
        RedeemOutcome::Resumed
    );
    assert!(matches!(
        monitor.refresh(&store)?,
        Some(MonitorEvent::Resumed { .. })
    ));

    let record = store.records_for(&session())?.remove(0);
    assert_eq!(
        record.reason(),
        &ViolationReason::ForbiddenKeyCombo("Alt+Tab".to_string())
    );
    assert!(record.is_cleared());
    Ok(())
}

#[test]
fn older_outstanding_passkey_does_not_verify() -> Result<()> {
    let legacy: Vec<ViolationRecord> = serde_json::from_str(
        r#"[
          {"examId":"exam-42","studentId":"student-7","timestamp":"2024-06-01T10:00:00.000Z",
           "reason":"TabHidden","passkey":"AAAA-BBBB-CCCC","cleared":false,"clearedAt":null},
          {"examId":"exam-42","studentId":"student-7","timestamp":"2024-06-01T10:10:00.000Z",
           "reason":"FullscreenExited","passkey":"DDDD-EEEE-FFFF","cleared":false,"clearedAt":null}
        ]"#,
    )?;
    let mut store = SqliteViolationStore::open(&shared_memory_uri())?;
    store.import(legacy)?;

    let authority = PasskeyAuthority::default();
    assert!(!authority.verify(&store, &session(), &Passkey::parse("AAAA-BBBB-CCCC")?)?);
    assert!(authority.verify(&store, &session(), &Passkey::parse("DDDD-EEEE-FFFF")?)?);

    // A monitor opened on this session starts locked on the latest violation.
    let monitor = open_monitor(&store, Vec::new())?;
    assert_eq!(monitor.state(), SessionState::Locked);
    assert_eq!(
        monitor.outstanding().map(|r| r.passkey().as_str().to_string()),
        Some("DDDD-EEEE-FFFF".to_string())
    );
    Ok(())
}

#[test]
fn one_physical_action_records_one_violation() -> Result<()> {
    let mut store = SqliteViolationStore::open(&shared_memory_uri())?;
    let alt_tab = vec![
        IntegritySignal::KeyDown(KeyChord::new("Tab").alt()),
        IntegritySignal::VisibilityChanged { hidden: true },
        IntegritySignal::FullscreenChanged { active: false },
    ];
    let mut monitor = open_monitor(&store, vec![alt_tab.clone(), alt_tab])?;
    monitor.pump(&mut store)?;
    monitor.pump(&mut store)?;
    assert_eq!(store.records_for(&session())?.len(), 1);
    Ok(())
}

#[test]
fn expiry_submits_and_stops_recording() -> Result<()> {
    let mut store = SqliteViolationStore::open(&shared_memory_uri())?;
    let mut monitor = open_monitor(
        &store,
        vec![vec![IntegritySignal::VisibilityChanged { hidden: true }]],
    )?;
    monitor.select_answer("q1", "c")?;
    let events = monitor.advance(&mut store, EXAM)?;
    assert!(matches!(
        &events[..],
        [MonitorEvent::Submitted(receipt)] if receipt.cause == SubmitCause::Timeout
    ));
    assert!(monitor.pump(&mut store)?.is_empty());
    assert!(store.records_for(&session())?.is_empty());
    assert!(monitor.signals().is_released());
    Ok(())
}

#[test]
fn two_tabs_share_one_lock_and_one_passkey() -> Result<()> {
    let uri = shared_memory_uri();
    let mut tab_a = SqliteViolationStore::open(&uri)?;
    let mut tab_b = SqliteViolationStore::open(&uri)?;

    let mut first = open_monitor(
        &tab_a,
        vec![vec![IntegritySignal::VisibilityChanged { hidden: true }]],
    )?;
    let mut second = open_monitor(&tab_b, Vec::new())?;

    let passkey = locked_passkey(&first.pump(&mut tab_a)?);

    // The idle tab notices the lock on its next poll and stops its clock.
    let events = second.advance(&mut tab_b, Duration::from_secs(30))?;
    assert_eq!(locked_passkey(&events), passkey);
    let frozen = second.remaining();
    second.advance(&mut tab_b, Duration::from_secs(600))?;
    assert_eq!(second.remaining(), frozen);
    assert!(second.select_answer("q1", "a").is_err());
    assert_eq!(tab_b.records_for(&session())?.len(), 1);

    let mut authority = PasskeyAuthority::default();
    assert_eq!(
        authority.redeem(&mut tab_b, &session(), passkey.as_str())?,
        RedeemOutcome::Resumed
    );
    assert!(matches!(
        second.refresh(&tab_b)?,
        Some(MonitorEvent::Resumed { .. })
    ));
    assert!(matches!(
        first.refresh(&tab_a)?,
        Some(MonitorEvent::Resumed { .. })
    ));
    Ok(())
}
