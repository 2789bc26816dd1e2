//! Recovery passkeys.
//!
//! A passkey is the bearer credential a locked student needs to resume an
//! exam. It is rendered as three groups of four characters drawn from an
//! alphabet without visually ambiguous glyphs (`0/O`, `1/I`), for example
//! `XQ7T-PLM4-9VKR`.

use anyhow::{anyhow, Result};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::OnceLock;

/// Characters a passkey may be minted from. 32 symbols, so a masked byte
/// maps onto it without modulo bias.
pub const PASSKEY_ALPHABET: &[u8; 32] = b"ABCDEFGHJKLMNPQRSTUVWXYZ23456789";
pub const PASSKEY_GROUPS: usize = 3;
pub const PASSKEY_GROUP_LEN: usize = 4;
/// 12 symbols plus the two separators.
pub const PASSKEY_RENDERED_LEN: usize = PASSKEY_GROUPS * PASSKEY_GROUP_LEN + PASSKEY_GROUPS - 1;

const MAX_ISSUE_ATTEMPTS: usize = 16;

#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Passkey(String);

impl Passkey {
    /// Normalizes free-form user input: uppercase, drop anything that is not
    /// ASCII alphanumeric, regroup in fours joined by `-`, and stop at twelve
    /// symbols.
    pub fn normalize(input: &str) -> String {
        let cleaned: Vec<char> = input
            .chars()
            .map(|c| c.to_ascii_uppercase())
            .filter(|c| c.is_ascii_alphanumeric())
            .take(PASSKEY_GROUPS * PASSKEY_GROUP_LEN)
            .collect();
        cleaned
            .chunks(PASSKEY_GROUP_LEN)
            .map(|group| group.iter().collect::<String>())
            .collect::<Vec<_>>()
            .join("-")
    }

    /// Normalizes `input` and requires the complete `XXXX-XXXX-XXXX` shape.
    pub fn parse(input: &str) -> Result<Self> {
        let normalized = Self::normalize(input);
        if !passkey_shape().is_match(&normalized) {
            return Err(anyhow!("passkey must have the form XXXX-XXXX-XXXX"));
        }
        Ok(Self(normalized))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn from_symbols(symbols: &[u8; PASSKEY_GROUPS * PASSKEY_GROUP_LEN]) -> Self {
        let mut out = String::with_capacity(PASSKEY_RENDERED_LEN);
        for (i, byte) in symbols.iter().enumerate() {
            if i > 0 && i % PASSKEY_GROUP_LEN == 0 {
                out.push('-');
            }
            out.push(PASSKEY_ALPHABET[(*byte & 0x1f) as usize] as char);
        }
        Self(out)
    }
}

fn passkey_shape() -> &'static regex::Regex {
    static PASSKEY_RE: OnceLock<regex::Regex> = OnceLock::new();
    PASSKEY_RE.get_or_init(|| {
        regex::Regex::new(r"^[A-Z0-9]{4}-[A-Z0-9]{4}-[A-Z0-9]{4}$")
            .expect("passkey pattern is valid")
    })
}

impl TryFrom<String> for Passkey {
    type Error = anyhow::Error;

    fn try_from(value: String) -> Result<Self> {
        Self::parse(&value)
    }
}

impl From<Passkey> for String {
    fn from(value: Passkey) -> Self {
        value.0
    }
}

impl fmt::Display for Passkey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// Passkeys are credentials; keep them out of debug output.
impl fmt::Debug for Passkey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Passkey({}-****-****)", &self.0[..PASSKEY_GROUP_LEN])
    }
}

/// Source of fresh passkeys.
pub trait TokenIssuer: Send {
    fn issue(&mut self) -> Result<Passkey>;

    /// Issues passkeys until one is not `taken`.
    fn issue_unique(&mut self, taken: &mut dyn FnMut(&Passkey) -> Result<bool>) -> Result<Passkey> {
        for _ in 0..MAX_ISSUE_ATTEMPTS {
            let candidate = self.issue()?;
            if !taken(&candidate)? {
                return Ok(candidate);
            }
            log::warn!("passkey collision with an outstanding violation; reissuing");
        }
        Err(anyhow!(
            "could not issue a unique passkey after {} attempts",
            MAX_ISSUE_ATTEMPTS
        ))
    }
}

/// Issues passkeys from the operating system CSPRNG.
#[derive(Clone, Copy, Debug, Default)]
pub struct OsTokenIssuer;

impl TokenIssuer for OsTokenIssuer {
    fn issue(&mut self) -> Result<Passkey> {
        let mut symbols = [0u8; PASSKEY_GROUPS * PASSKEY_GROUP_LEN];
        OsRng
            .try_fill_bytes(&mut symbols)
            .map_err(|e| anyhow!("os random source unavailable: {}", e))?;
        Ok(Passkey::from_symbols(&symbols))
    }
}

/// Replays a fixed list of passkeys. Intended for tests and simulations.
#[derive(Clone, Debug, Default)]
pub struct FixedTokenIssuer {
    queue: std::collections::VecDeque<Passkey>,
}

impl FixedTokenIssuer {
    pub fn new<I, S>(passkeys: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let queue = passkeys
            .into_iter()
            .map(|p| Passkey::parse(p.as_ref()))
            .collect::<Result<_>>()?;
        Ok(Self { queue })
    }
}

impl TokenIssuer for FixedTokenIssuer {
    fn issue(&mut self) -> Result<Passkey> {
        self.queue
            .pop_front()
            .ok_or_else(|| anyhow!("fixed passkey issuer exhausted"))
    }
}
