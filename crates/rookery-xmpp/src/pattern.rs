//! Wildcard JID patterns for route matching.
//!
//! Concrete client addresses are `jid` crate values, which reject
//! partial or wildcard JIDs by design. Route tables need exactly those:
//! a component may claim `*@conference.example.net/*`, and a bare
//! address has to reach a route registered with a resource. This module
//! provides the three-field pattern type the router matches on.
//!
//! A field that is literally `*` matches any value, present or absent.
//! A missing resource on either side also matches anything; local and
//! domain parts only ignore absence when the other side is `*`.

use std::fmt;
use std::str::FromStr;

use jid::{FullJid, Jid};

use crate::XmppError;

/// A JID pattern: `local@domain/resource` with optional parts.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct JidPattern {
    local: Option<String>,
    domain: Option<String>,
    resource: Option<String>,
}

/// The wildcard field value.
const WILDCARD: &str = "*";

impl JidPattern {
    /// Build a pattern from explicit parts.
    pub fn new(
        local: Option<&str>,
        domain: Option<&str>,
        resource: Option<&str>,
    ) -> Self {
        Self {
            local: local.map(str::to_owned),
            domain: domain.map(str::to_owned),
            resource: resource.map(str::to_owned),
        }
    }

    /// The local part, if any.
    pub fn local(&self) -> Option<&str> {
        self.local.as_deref()
    }

    /// The domain part, if any.
    pub fn domain(&self) -> Option<&str> {
        self.domain.as_deref()
    }

    /// The resource part, if any.
    pub fn resource(&self) -> Option<&str> {
        self.resource.as_deref()
    }

    /// Wildcard-aware match, symmetric in its arguments.
    ///
    /// `*` on either side matches any value in that field, including an
    /// absent one. A resource missing from either side matches any
    /// resource.
    pub fn matches(&self, other: &JidPattern) -> bool {
        if !part_matches(self.local.as_deref(), other.local.as_deref()) {
            return false;
        }
        if !part_matches(self.domain.as_deref(), other.domain.as_deref()) {
            return false;
        }
        // Resources only disagree when both are present, neither is a
        // wildcard, and the values differ.
        match (self.resource.as_deref(), other.resource.as_deref()) {
            (Some(a), Some(b)) => a == WILDCARD || b == WILDCARD || a == b,
            _ => true,
        }
    }
}

/// Local/domain field comparison: absence only matches a wildcard.
fn part_matches(a: Option<&str>, b: Option<&str>) -> bool {
    match (a, b) {
        (None, None) => true,
        (None, Some(value)) | (Some(value), None) => value == WILDCARD,
        (Some(a), Some(b)) => a == WILDCARD || b == WILDCARD || a == b,
    }
}

impl FromStr for JidPattern {
    type Err = XmppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (bare, resource) = match s.split_once('/') {
            Some((bare, resource)) => (bare, Some(resource)),
            None => (s, None),
        };
        let (local, domain) = match bare.split_once('@') {
            Some((local, domain)) => (Some(local), domain),
            None => (None, bare),
        };
        if domain.is_empty() {
            return Err(XmppError::protocol(format!("JID '{}' has no domain", s)));
        }
        Ok(Self::new(local, Some(domain), resource))
    }
}

impl fmt::Display for JidPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(local) = &self.local {
            write!(f, "{}@", local)?;
        }
        if let Some(domain) = &self.domain {
            write!(f, "{}", domain)?;
        }
        if let Some(resource) = &self.resource {
            write!(f, "/{}", resource)?;
        }
        Ok(())
    }
}

impl From<&Jid> for JidPattern {
    fn from(jid: &Jid) -> Self {
        Self::new(
            jid.node().map(|n| n.as_str()),
            Some(jid.domain().as_str()),
            jid.resource().map(|r| r.as_str()),
        )
    }
}

impl From<&FullJid> for JidPattern {
    fn from(jid: &FullJid) -> Self {
        Self::new(
            jid.node().map(|n| n.as_str()),
            Some(jid.domain().as_str()),
            Some(jid.resource().as_str()),
        )
    }
}
