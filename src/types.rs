//! Core data types used throughout origin-control
//!
//! The unit of work is a [`PackageRecord`]: a package identified by its
//! [`PackageKey`] together with the [`Restrictions`] that should be applied to
//! it. The same seven-field record is read from the input file, persisted in
//! workspace task files, and appended to backups.
//!
//! ## Examples
//!
//! ```rust
//! use origin_control::types::{PackageRecord, Restriction};
//!
//! let record = PackageRecord {
//!     domain: "corp".to_string(),
//!     repository: "internal".to_string(),
//!     format: "npm".to_string(),
//!     namespace: String::new(),
//!     package: "left-pad".to_string(),
//!     upstream: Restriction::Block,
//!     publish: Restriction::Allow,
//! };
//!
//! assert_eq!(record.key().task_id(), "corp-internal-npm--left-pad");
//! ```

use crate::error::{OriginError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Field names of a package record, in serialization order
pub const CSV_HEADER: [&str; 7] = [
    "domain",
    "repository",
    "format",
    "namespace",
    "package",
    "upstream",
    "publish",
];

/// Package formats understood by plan generation
pub const PACKAGE_FORMATS: [&str; 4] = ["npm", "pypi", "maven", "nuget"];

/// A single origin restriction flag
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Restriction {
    /// The origin is allowed
    Allow,
    /// The origin is blocked
    Block,
}

impl Restriction {
    /// Wire representation (`ALLOW` or `BLOCK`)
    pub fn as_str(&self) -> &'static str {
        match self {
            Restriction::Allow => "ALLOW",
            Restriction::Block => "BLOCK",
        }
    }
}

impl fmt::Display for Restriction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Restriction {
    type Err = OriginError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "ALLOW" => Ok(Restriction::Allow),
            "BLOCK" => Ok(Restriction::Block),
            other => Err(OriginError::InvalidRestriction(format!(
                "{} is not one of ALLOW, BLOCK",
                other
            ))),
        }
    }
}

/// The pair of origin restrictions carried by a package
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Restrictions {
    /// Whether new versions may be ingested from upstream repositories
    pub upstream: Restriction,
    /// Whether new versions may be published directly
    pub publish: Restriction,
}

impl Restrictions {
    /// Both origins allowed
    pub const ALLOW_ALL: Restrictions = Restrictions {
        upstream: Restriction::Allow,
        publish: Restriction::Allow,
    };

    /// Upstream versions blocked, publishing allowed
    pub const UPSTREAM_BLOCKED: Restrictions = Restrictions {
        upstream: Restriction::Block,
        publish: Restriction::Allow,
    };
}

impl Default for Restrictions {
    fn default() -> Self {
        Self::ALLOW_ALL
    }
}

/// Composite key identifying a package in a registry
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PackageKey {
    /// Registry domain
    pub domain: String,
    /// Repository inside the domain
    pub repository: String,
    /// Package format (npm, pypi, ...)
    pub format: String,
    /// Package namespace, empty when the format has none
    pub namespace: String,
    /// Package name
    pub package: String,
}

impl PackageKey {
    /// Filename of the task that carries this package inside a workspace
    pub fn task_id(&self) -> String {
        format!(
            "{}-{}-{}-{}-{}",
            self.domain, self.repository, self.format, self.namespace, self.package
        )
    }

    /// Namespace as an option, `None` when empty
    pub fn namespace(&self) -> Option<&str> {
        if self.namespace.is_empty() {
            None
        } else {
            Some(&self.namespace)
        }
    }
}

impl fmt::Display for PackageKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.namespace() {
            Some(ns) => write!(
                f,
                "{}/{}/{}:{}/{}",
                self.domain, self.repository, self.format, ns, self.package
            ),
            None => write!(
                f,
                "{}/{}/{}:{}",
                self.domain, self.repository, self.format, self.package
            ),
        }
    }
}

/// A package and the restrictions associated with it
///
/// Field order matches [`CSV_HEADER`] and is significant for serialization.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageRecord {
    /// Registry domain
    pub domain: String,
    /// Repository inside the domain
    pub repository: String,
    /// Package format
    pub format: String,
    /// Package namespace, possibly empty
    pub namespace: String,
    /// Package name
    pub package: String,
    /// Upstream restriction
    pub upstream: Restriction,
    /// Publish restriction
    pub publish: Restriction,
}

impl PackageRecord {
    /// Build a record from a key and a set of restrictions
    pub fn new(key: PackageKey, restrictions: Restrictions) -> Self {
        Self {
            domain: key.domain,
            repository: key.repository,
            format: key.format,
            namespace: key.namespace,
            package: key.package,
            upstream: restrictions.upstream,
            publish: restrictions.publish,
        }
    }

    /// Composite key of the package
    pub fn key(&self) -> PackageKey {
        PackageKey {
            domain: self.domain.clone(),
            repository: self.repository.clone(),
            format: self.format.clone(),
            namespace: self.namespace.clone(),
            package: self.package.clone(),
        }
    }

    /// Restrictions carried by the record
    pub fn restrictions(&self) -> Restrictions {
        Restrictions {
            upstream: self.upstream,
            publish: self.publish,
        }
    }

    /// Same package with different restrictions
    pub fn with_restrictions(&self, restrictions: Restrictions) -> Self {
        Self::new(self.key(), restrictions)
    }

    /// Fields as strings, in [`CSV_HEADER`] order
    pub fn to_fields(&self) -> [&str; 7] {
        [
            self.domain.as_str(),
            self.repository.as_str(),
            self.format.as_str(),
            self.namespace.as_str(),
            self.package.as_str(),
            self.upstream.as_str(),
            self.publish.as_str(),
        ]
    }
}
