//! Destination domain newtype
//!
//! Every batch is addressed to exactly one destination domain, and the
//! dispatch engine keys its queues, leases and statistics on it. Domains are
//! normalised on construction (trimmed, lower-cased, trailing dot removed) so
//! that `Example.COM.` and `example.com` share one queue.

use std::{
    fmt::{self, Display},
    ops::Deref,
    sync::Arc,
};

use serde::{Deserialize, Serialize};

/// A normalised destination domain
///
/// Cloning is cheap: the name is shared behind an `Arc<str>`.
///
/// # Examples
///
/// ```
/// use courier_common::Domain;
///
/// let domain = Domain::new(" Mail.Example.COM. ");
/// assert_eq!(domain.as_str(), "mail.example.com");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub struct Domain(Arc<str>);

impl Domain {
    /// Reserved value callers use for recipients whose domain could not be
    /// resolved. Batches addressed to it are answered immediately and never
    /// queued.
    pub const INVALID_SENTINEL: &'static str = "<invalid-domain>";

    /// Create a new `Domain`, normalising the input
    #[must_use]
    pub fn new(s: impl AsRef<str>) -> Self {
        let trimmed = s.as_ref().trim();
        let trimmed = trimmed.strip_suffix('.').unwrap_or(trimmed);

        if trimmed.bytes().any(|b| b.is_ascii_uppercase()) {
            Self(Arc::from(trimmed.to_ascii_lowercase()))
        } else {
            Self(Arc::from(trimmed))
        }
    }

    /// The reserved invalid-domain sentinel
    #[must_use]
    pub fn invalid() -> Self {
        Self(Arc::from(Self::INVALID_SENTINEL))
    }

    /// Whether this is the reserved invalid-domain sentinel
    #[must_use]
    pub fn is_invalid(&self) -> bool {
        &*self.0 == Self::INVALID_SENTINEL
    }

    /// Get the domain as a string slice
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for Domain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for Domain {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl Deref for Domain {
    type Target = str;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl From<String> for Domain {
    fn from(s: String) -> Self {
        Self::new(s)
    }
}

impl From<&str> for Domain {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<Domain> for String {
    fn from(domain: Domain) -> Self {
        domain.0.to_string()
    }
}
