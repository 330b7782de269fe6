// =============================================================================
// Matrixon Identity - ThreePid Module
// =============================================================================
//
// Project: Matrixon - Ultra High Performance Matrix NextServer (Synapse Alternative)
// Author: arkSong (arksong2018@gmail.com) - Founder of Matrixon Innovation Project
// Date: 2024-12-11
// Version: 0.11.0-alpha
// License: Apache 2.0 / MIT
//
// Description:
//   Third-party identifiers (email addresses and phone numbers) and the
//   lookup results that map them to Matrix users.
//
// =============================================================================

use std::{fmt, str::FromStr};

use ruma::{thirdparty::Medium, OwnedUserId};
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// A normalized third-party identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "medium", content = "address", rename_all = "lowercase")]
pub enum ThreePid {
    /// Email address, trimmed and lower-cased
    Email(String),
    /// Phone number in international format, digits only
    Msisdn(String),
}

impl ThreePid {
    /// Build an email ThreePid, normalizing the address
    pub fn email(address: &str) -> Result<Self> {
        let normalized = address.trim().to_lowercase();
        let mut parts = normalized.split('@');
        let valid = match (parts.next(), parts.next(), parts.next()) {
            (Some(local), Some(domain), None) => {
                !local.is_empty() && !domain.is_empty() && !normalized.contains(char::is_whitespace)
            }
            _ => false,
        };

        if !valid {
            return Err(Error::InvalidInput(format!("invalid email address: {address}")));
        }

        Ok(Self::Email(normalized))
    }

    /// Build a phone number ThreePid, keeping digits only
    pub fn msisdn(number: &str) -> Result<Self> {
        let trimmed = number.trim();
        let trimmed = trimmed.strip_prefix('+').unwrap_or(trimmed);
        let normalized: String = trimmed
            .chars()
            .filter(|c| !matches!(c, ' ' | '-' | '(' | ')'))
            .collect();

        if !(4..=15).contains(&normalized.len()) || !normalized.chars().all(|c| c.is_ascii_digit()) {
            return Err(Error::InvalidInput(format!("invalid phone number: {number}")));
        }

        Ok(Self::Msisdn(normalized))
    }

    pub fn address(&self) -> &str {
        match self {
            Self::Email(address) | Self::Msisdn(address) => address,
        }
    }

    pub fn medium(&self) -> Medium {
        match self {
            Self::Email(_) => Medium::Email,
            Self::Msisdn(_) => Medium::Msisdn,
        }
    }

    /// Medium as used in identity service URLs and payloads
    pub fn medium_str(&self) -> &'static str {
        match self {
            Self::Email(_) => "email",
            Self::Msisdn(_) => "msisdn",
        }
    }
}

impl fmt::Display for ThreePid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.medium_str(), self.address())
    }
}

/// Parses `email:<address>` or `msisdn:<number>`; a bare address containing
/// `@` is taken as an email.
impl FromStr for ThreePid {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.split_once(':') {
            Some(("email", address)) => Self::email(address),
            Some(("msisdn", number)) | Some(("phone", number)) => Self::msisdn(number),
            _ if s.contains('@') => Self::email(s),
            _ => Err(Error::InvalidInput(format!(
                "expected email:<address> or msisdn:<number>, got {s}"
            ))),
        }
    }
}

/// A ThreePid that resolved to a known Matrix user
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FoundThreePid {
    pub threepid: ThreePid,
    pub user_id: OwnedUserId,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use test_log::test;

    #[test]
    fn test_email_is_normalized() {
        let threepid = ThreePid::email("  Alice@Example.COM ").unwrap();
        assert_eq!(threepid, ThreePid::Email("alice@example.com".to_string()));
        assert_eq!(threepid.medium(), Medium::Email);
    }

    #[test]
    fn test_invalid_emails_are_rejected() {
        for bad in ["", "alice", "@example.com", "alice@", "a@b@c", "al ice@example.com"] {
            assert!(
                matches!(ThreePid::email(bad), Err(Error::InvalidInput(_))),
                "{bad:?} should be rejected"
            );
        }
    }

    #[test]
    fn test_msisdn_is_normalized() {
        let threepid = ThreePid::msisdn("+44 (7700) 900-123").unwrap();
        assert_eq!(threepid.address(), "447700900123");
        assert_eq!(threepid.medium(), Medium::Msisdn);
    }

    #[test]
    fn test_invalid_msisdn_is_rejected() {
        assert!(ThreePid::msisdn("12").is_err());
        assert!(ThreePid::msisdn("4477OO900123").is_err());
        assert!(ThreePid::msisdn("1234567890123456").is_err());
    }

    #[test]
    fn test_hash_and_equality_use_kind_and_value() {
        let mut set = HashSet::new();
        set.insert(ThreePid::email("bob@example.com").unwrap());
        set.insert(ThreePid::email("BOB@example.com").unwrap());
        set.insert(ThreePid::Msisdn("bob@example.com".to_string()));
        assert_eq!(set.len(), 2);
    }

    #[test]
    fn test_parse_from_str() {
        let email: ThreePid = "email:carol@example.org".parse().unwrap();
        assert_eq!(email, ThreePid::Email("carol@example.org".to_string()));

        let bare: ThreePid = "carol@example.org".parse().unwrap();
        assert_eq!(bare, email);

        let phone: ThreePid = "msisdn:+15551234567".parse().unwrap();
        assert_eq!(phone, ThreePid::Msisdn("15551234567".to_string()));
        assert_eq!(phone.to_string(), "msisdn:15551234567");

        assert!("fax:12345".parse::<ThreePid>().is_err());
    }

    #[test]
    fn test_serde_shape() {
        let threepid = ThreePid::email("dave@example.com").unwrap();
        let json = serde_json::to_value(&threepid).unwrap();
        assert_eq!(json, serde_json::json!({ "medium": "email", "address": "dave@example.com" }));
        let back: ThreePid = serde_json::from_value(json).unwrap();
        assert_eq!(back, threepid);
    }
}
