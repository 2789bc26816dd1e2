//! recovery_console - staff CLI over the violation log
//!
//! Lists and searches violations, looks up passkeys read out by students,
//! clears violations on staff authority, and checks the audit chain.
//! Student passkey redemption is served by `proctord`, whose authority keeps
//! the failed-attempt count across requests.

use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand};

use crate::{
    verify_chain, ClearOutcome, Passkey, PasskeyAuthority, RecoveryConsole, SessionKey,
    SqliteViolationStore, StaffId, StatusFilter, TimeWindow, ViolationFilter, ViolationRecord,
    ViolationStore,
};

#[derive(Parser, Debug)]
#[command(name = "recovery_console", about = "Exam violation recovery console")]
struct Args {
    #[arg(long, env = "PROCTOR_DB_PATH", default_value = "proctor.db", global = true)]
    db: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List violations, newest first
    List {
        #[arg(long, default_value = "all")]
        status: StatusFilter,
        #[arg(long, default_value = "all")]
        window: TimeWindow,
        /// Free-text search over ids, reason, and passkey
        #[arg(long)]
        q: Option<String>,
        #[arg(short, long)]
        verbose: bool,
    },

    /// Show every violation of one session
    Show {
        #[arg(long)]
        exam: String,
        #[arg(long)]
        student: String,
    },

    /// Find the violation a passkey belongs to
    Lookup { passkey: String },

    /// Check a passkey against a session's latest violation (no changes)
    Verify {
        #[arg(long)]
        exam: String,
        #[arg(long)]
        student: String,
        #[arg(long)]
        passkey: String,
    },

    /// Clear a violation on staff authority
    Clear {
        #[arg(long)]
        exam: String,
        #[arg(long)]
        student: String,
        #[arg(long)]
        passkey: String,
        #[arg(long, env = "PROCTOR_STAFF_ID")]
        staff: String,
    },

    /// Append records from a JSON array of violation records
    Import {
        #[arg(long)]
        input: String,
    },

    /// Write matching violations as a JSON array
    Export {
        #[arg(long)]
        output: String,
        #[arg(long, default_value = "all")]
        status: StatusFilter,
    },

    /// Verify the audit hash chain
    Audit {
        #[arg(short, long)]
        verbose: bool,
    },
}

pub fn run() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();
    let mut store = SqliteViolationStore::open(&args.db)?;

    match args.command {
        Command::List {
            status,
            window,
            q,
            verbose,
        } => cmd_list(&store, status, window, q.as_deref(), verbose),
        Command::Show { exam, student } => cmd_show(&store, &SessionKey::new(&exam, &student)?),
        Command::Lookup { passkey } => cmd_lookup(&mut store, &passkey),
        Command::Verify {
            exam,
            student,
            passkey,
        } => cmd_verify(&store, &SessionKey::new(&exam, &student)?, &passkey),
        Command::Clear {
            exam,
            student,
            passkey,
            staff,
        } => cmd_clear(
            &mut store,
            &SessionKey::new(&exam, &student)?,
            &passkey,
            &staff,
        ),
        Command::Import { input } => cmd_import(&mut store, &input),
        Command::Export { output, status } => cmd_export(&store, &output, status),
        Command::Audit { verbose } => cmd_audit(&store, verbose),
    }
}

fn cmd_list(
    store: &dyn ViolationStore,
    status: StatusFilter,
    window: TimeWindow,
    q: Option<&str>,
    verbose: bool,
) -> Result<()> {
    let mut filter = ViolationFilter::new().status(status).window(window);
    if let Some(q) = q {
        filter = filter.search(q);
    }
    let records = store.list(&filter)?;

    println!("=== Violations ===");
    for record in &records {
        print_record(record, verbose);
    }
    println!("Total: {}", records.len());
    Ok(())
}

fn cmd_show(store: &dyn ViolationStore, key: &SessionKey) -> Result<()> {
    let records = store.records_for(key)?;
    println!("=== Session {} ===", key);
    for record in &records {
        print_record(record, true);
    }
    println!("Total: {}", records.len());
    Ok(())
}

fn cmd_lookup(store: &mut dyn ViolationStore, input: &str) -> Result<()> {
    let console = RecoveryConsole::new(store, StaffId::new("lookup")?);
    match console.find_by_passkey(input)? {
        Some(record) => {
            print_record(&record, true);
            if record.is_cleared() {
                println!("This violation is already cleared.");
            }
            Ok(())
        }
        None => Err(anyhow!("no violation carries passkey {}", Passkey::normalize(input))),
    }
}

fn cmd_verify(store: &dyn ViolationStore, key: &SessionKey, input: &str) -> Result<()> {
    let passkey = Passkey::parse(input)?;
    if PasskeyAuthority::default().verify(store, key, &passkey)? {
        println!("MATCH: passkey belongs to the latest violation of {}", key);
        Ok(())
    } else {
        println!("NO MATCH for {}", key);
        Err(anyhow!("passkey does not match the latest violation"))
    }
}

fn cmd_clear(
    store: &mut dyn ViolationStore,
    key: &SessionKey,
    input: &str,
    staff: &str,
) -> Result<()> {
    let passkey = Passkey::parse(input)?;
    let mut console = RecoveryConsole::new(store, StaffId::new(staff)?);
    match console.clear(key, &passkey)? {
        ClearOutcome::Cleared => {
            println!("CLEARED {} by {}", key, console.staff().0);
            Ok(())
        }
        ClearOutcome::AlreadyCleared => {
            println!("Already cleared: {}", key);
            Ok(())
        }
        ClearOutcome::NotFound => Err(anyhow!("no violation for {} with that passkey", key)),
    }
}

fn cmd_import(store: &mut dyn ViolationStore, input: &str) -> Result<()> {
    let json =
        std::fs::read_to_string(input).map_err(|e| anyhow!("failed to read {}: {}", input, e))?;
    let records: Vec<ViolationRecord> =
        serde_json::from_str(&json).map_err(|e| anyhow!("failed to parse {}: {}", input, e))?;
    let n = store.import(records)?;
    println!("Imported {} records from {}", n, input);
    Ok(())
}

fn cmd_export(store: &dyn ViolationStore, output: &str, status: StatusFilter) -> Result<()> {
    let records = store.list(&ViolationFilter::new().status(status))?;
    let json = serde_json::to_string_pretty(&records)?;
    std::fs::write(output, json).map_err(|e| anyhow!("failed to write {}: {}", output, e))?;
    println!("Exported {} records to {}", records.len(), output);
    Ok(())
}

fn cmd_audit(store: &dyn ViolationStore, verbose: bool) -> Result<()> {
    let trail = store.audit_trail()?;
    if verbose {
        for (i, record) in trail.iter().enumerate() {
            println!("#{} {} {}", i, hex::encode(record.entry_hash()), record.key());
        }
    }
    match verify_chain(&trail)? {
        None => {
            println!("Audit chain OK ({} entries)", trail.len());
            Ok(())
        }
        Some(brk) => Err(anyhow!("{}", brk)),
    }
}

fn print_record(record: &ViolationRecord, verbose: bool) {
    let status = if record.is_cleared() { "CLEARED" } else { "ACTIVE" };
    println!(
        "{} {} {} {} [{}]",
        record.timestamp().to_rfc3339(),
        status,
        record.key(),
        record.passkey(),
        record.reason()
    );
    if verbose {
        if let Some(at) = record.cleared_at() {
            println!("  cleared_at: {}", at.to_rfc3339());
        }
        if let Some(by) = record.cleared_by() {
            println!("  cleared_by: {}", by);
        }
        println!("  entry_hash: {}", hex::encode(record.entry_hash()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn staff_commands_parse() {
        let args = Args::try_parse_from([
            "recovery_console",
            "--db",
            "x.db",
            "clear",
            "--exam",
            "e",
            "--student",
            "s",
            "--passkey",
            "AAAA-AAAA-AAAA",
            "--staff",
            "proctor",
        ])
        .unwrap();
        assert_eq!(args.db, "x.db");
        assert!(matches!(args.command, Command::Clear { .. }));
    }

    #[test]
    fn redeem_is_not_a_staff_command() {
        let parsed = Args::try_parse_from([
            "recovery_console",
            "redeem",
            "--exam",
            "e",
            "--student",
            "s",
            "--passkey",
            "AAAA-AAAA-AAAA",
        ]);
        assert!(parsed.is_err());
    }
}
