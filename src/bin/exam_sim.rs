//! exam_sim - scripted exam session
//!
//! Replays a JSON script of integrity signals, clock advances, answers, and
//! passkey redemptions against a session monitor, printing each transition.
//!
//! Script example:
//!   [{"tick": [{"signal": "fullscreenChanged", "active": false}]},
//!    {"advance": {"secs": 30}},
//!    "redeemIssued",
//!    {"answer": {"question": "q1", "option": "b"}},
//!    "submit"]

use anyhow::{anyhow, Result};
use clap::Parser;
use serde::Deserialize;
use std::time::Duration;

use proctor_kernel::{
    config::ProctorConfig, InMemoryViolationStore, IntegritySignal, MonitorEvent, Passkey,
    PasskeyAuthority, ScriptedSignals, SessionKey, SessionMonitor, SqliteViolationStore,
    ViolationStore,
};

#[derive(Parser, Debug)]
#[command(name = "exam_sim", about = "Replay a scripted exam session")]
struct Args {
    #[arg(long)]
    script: String,
    /// Violation log; an in-memory log is used when omitted
    #[arg(long)]
    db: Option<String>,
    #[arg(long, default_value = "exam-demo")]
    exam: String,
    #[arg(long, default_value = "student-demo")]
    student: String,
    #[arg(long, default_value_t = 3600)]
    duration_secs: u64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
enum Step {
    Tick(Vec<IntegritySignal>),
    Advance { secs: u64 },
    Answer { question: String, option: String },
    /// Redeem the passkey most recently shown to the student.
    RedeemIssued,
    Redeem(String),
    Refresh,
    Submit,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();
    let config = ProctorConfig::load()?;

    let raw = std::fs::read_to_string(&args.script)
        .map_err(|e| anyhow!("failed to read {}: {}", args.script, e))?;
    let steps: Vec<Step> =
        serde_json::from_str(&raw).map_err(|e| anyhow!("failed to parse {}: {}", args.script, e))?;

    let mut store: Box<dyn ViolationStore> = match &args.db {
        Some(path) => Box::new(SqliteViolationStore::open(path)?),
        None => Box::new(InMemoryViolationStore::new()),
    };
    let key = SessionKey::new(&args.exam, &args.student)?;
    let mut monitor = SessionMonitor::open(
        &*store,
        key.clone(),
        Duration::from_secs(args.duration_secs),
        ScriptedSignals::default(),
        config.monitor_settings(),
    )?;
    let mut authority = PasskeyAuthority::new(config.max_redeem_attempts);
    let mut shown: Option<Passkey> = None;

    println!("=== Exam Session {} ===", key);
    println!("State: {:?}", monitor.state());

    for (i, step) in steps.into_iter().enumerate() {
        let events = match step {
            Step::Tick(signals) => {
                monitor.signals_mut().push_tick(signals);
                monitor.pump(&mut *store)?
            }
            Step::Advance { secs } => monitor.advance(&mut *store, Duration::from_secs(secs))?,
            Step::Answer { question, option } => {
                match monitor.select_answer(&question, &option) {
                    Ok(()) => println!("[{i}] answered {question} = {option}"),
                    Err(err) => println!("[{i}] answer refused: {err}"),
                }
                Vec::new()
            }
            Step::RedeemIssued => {
                let passkey = shown
                    .clone()
                    .ok_or_else(|| anyhow!("step {}: no passkey has been issued", i))?;
                redeem(&mut authority, &mut *store, &mut monitor, i, passkey.as_str())?
            }
            Step::Redeem(input) => {
                redeem(&mut authority, &mut *store, &mut monitor, i, &input)?
            }
            Step::Refresh => monitor.refresh(&*store)?.into_iter().collect(),
            Step::Submit => match monitor.submit() {
                Ok(receipt) => vec![MonitorEvent::Submitted(receipt)],
                Err(err) => {
                    println!("[{i}] submit refused: {err}");
                    Vec::new()
                }
            },
        };

        for event in events {
            match event {
                MonitorEvent::Locked { reason, passkey } => {
                    println!("[{i}] LOCKED: {}", reason);
                    println!("[{i}] recovery passkey: {}", passkey);
                    shown = Some(passkey);
                }
                MonitorEvent::Resumed { remaining } => {
                    println!("[{i}] RESUMED with {}s remaining", remaining.as_secs());
                }
                MonitorEvent::Submitted(receipt) => {
                    println!("[{i}] SUBMITTED ({:?})", receipt.cause);
                    println!("{}", serde_json::to_string_pretty(&receipt)?);
                }
            }
        }
    }

    println!(
        "Final state: {:?}, {}s remaining",
        monitor.state(),
        monitor.remaining().as_secs()
    );
    Ok(())
}

fn redeem(
    authority: &mut PasskeyAuthority,
    store: &mut dyn ViolationStore,
    monitor: &mut SessionMonitor<ScriptedSignals>,
    step: usize,
    input: &str,
) -> Result<Vec<MonitorEvent>> {
    let outcome = authority.redeem(store, monitor.key(), input)?;
    println!("[{step}] redeem: {:?}", outcome);
    Ok(monitor.refresh(store)?.into_iter().collect())
}
