//! Retention exception rules.
//!
//! Rules are stored as strings on the retention policy and parsed here:
//!
//! | rule                | matches                       |
//! |---------------------|-------------------------------|
//! | `kind:<n>`          | a single kind                 |
//! | `kinds:<a>-<b>`     | an inclusive kind range       |
//! | `pubkey:<hex|npub>` | every event by one author     |
//! | `profiles`          | kind 0                        |
//! | `contacts`          | kind 3                        |
//! | `deletions`         | kind 5                        |
//! | `replaceable`       | kinds 10000-19999             |
//! | `addressable`       | kinds 30000-39999             |

use std::fmt;
use std::str::FromStr;

use nostr::PublicKey;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetentionException {
    Kind(u16),
    KindRange { start: u16, end: u16 },
    /// Hex-encoded author pubkey.
    Pubkey(String),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Invalid retention exception '{rule}': {reason}")]
pub struct ExceptionParseError {
    pub rule: String,
    pub reason: String,
}

impl ExceptionParseError {
    fn new(rule: &str, reason: impl Into<String>) -> Self {
        Self {
            rule: rule.to_string(),
            reason: reason.into(),
        }
    }
}

fn parse_kind(rule: &str, raw: &str) -> Result<u16, ExceptionParseError> {
    raw.trim()
        .parse::<u16>()
        .map_err(|_| ExceptionParseError::new(rule, format!("'{raw}' is not a valid kind")))
}

impl FromStr for RetentionException {
    type Err = ExceptionParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let rule = s.trim();
        match rule {
            "profiles" => return Ok(Self::Kind(0)),
            "contacts" => return Ok(Self::Kind(3)),
            "deletions" => return Ok(Self::Kind(5)),
            "replaceable" => {
                return Ok(Self::KindRange {
                    start: 10_000,
                    end: 19_999,
                });
            }
            "addressable" => {
                return Ok(Self::KindRange {
                    start: 30_000,
                    end: 39_999,
                });
            }
            _ => {}
        }

        let Some((prefix, value)) = rule.split_once(':') else {
            return Err(ExceptionParseError::new(rule, "unknown rule"));
        };

        match prefix {
            "kind" => parse_kind(rule, value).map(Self::Kind),
            "kinds" => {
                let (start, end) = value
                    .split_once('-')
                    .ok_or_else(|| ExceptionParseError::new(rule, "expected <start>-<end>"))?;
                let start = parse_kind(rule, start)?;
                let end = parse_kind(rule, end)?;
                if start > end {
                    return Err(ExceptionParseError::new(rule, "range start exceeds end"));
                }
                Ok(Self::KindRange { start, end })
            }
            "pubkey" => PublicKey::parse(value.trim())
                .map(|pk| Self::Pubkey(pk.to_hex()))
                .map_err(|e| ExceptionParseError::new(rule, e.to_string())),
            _ => Err(ExceptionParseError::new(rule, "unknown rule")),
        }
    }
}

impl fmt::Display for RetentionException {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Kind(kind) => write!(f, "kind:{kind}"),
            Self::KindRange { start, end } => write!(f, "kinds:{start}-{end}"),
            Self::Pubkey(pubkey) => write!(f, "pubkey:{pubkey}"),
        }
    }
}

/// Parse every rule, failing on the first invalid one.
pub fn parse_exceptions(rules: &[String]) -> Result<Vec<RetentionException>, ExceptionParseError> {
    rules.iter().map(|rule| rule.parse()).collect()
}
