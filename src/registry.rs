//! Package registry collaborators
//!
//! The core never talks to a concrete registry. It goes through the
//! [`RegistryClient`] trait, which covers the four calls a run needs:
//! reading and writing the origin restrictions of one package, listing the
//! packages of a repository and describing a repository's upstreams.
//!
//! Two implementations ship with the crate:
//!
//! - [`FileRegistry`]: an offline registry whose whole state lives in a JSON
//!   file. It is used to rehearse a run before touching a live registry and
//!   as the collaborator in tests.
//! - [`TimeoutClient`]: wraps any client and bounds every call by a timeout.
//!
//! All clients must be safe to share between dispatcher workers.

use crate::error::{OriginError, Result};
use crate::types::{PackageKey, Restrictions};
use crate::utils;
use crossbeam_channel::{bounded, RecvTimeoutError};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

/// A package as returned by a repository listing
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PackageSummary {
    /// Package format
    pub format: String,
    /// Namespace, empty when the format has none
    #[serde(default)]
    pub namespace: String,
    /// Package name
    pub package: String,
}

/// Optional filters for [`RegistryClient::list_packages`]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PackageFilter {
    /// Only packages of this format
    pub format: Option<String>,
    /// Only packages in this namespace
    pub namespace: Option<String>,
    /// Only packages whose name starts with this prefix
    pub prefix: Option<String>,
}

impl PackageFilter {
    /// Check whether a package passes every configured filter
    pub fn matches(&self, package: &PackageSummary) -> bool {
        self.format.as_deref().map_or(true, |f| f == package.format)
            && self
                .namespace
                .as_deref()
                .map_or(true, |ns| ns == package.namespace)
            && self
                .prefix
                .as_deref()
                .map_or(true, |p| package.package.starts_with(p))
    }
}

/// Direct connection from a repository to a public registry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExternalConnection {
    /// Connection name, e.g. `public:npmjs`
    pub name: String,
    /// Format served by the connection
    pub package_format: String,
}

/// Upstream repositories and external connections of a repository
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepositoryUpstreams {
    /// Names of upstream repositories, never containing the repository itself
    pub upstreams: Vec<String>,
    /// External connections attached to the repository
    pub external_connections: Vec<ExternalConnection>,
}

impl RepositoryUpstreams {
    /// Whether an external connection serves the given format
    pub fn has_external_connection_for(&self, format: &str) -> bool {
        self.external_connections
            .iter()
            .any(|ec| ec.package_format == format)
    }
}

/// Remote registry operations used by a run
///
/// Any error returned by these methods is treated as a failure of the task
/// that triggered the call.
pub trait RegistryClient: Send + Sync {
    /// Domain this client is bound to
    fn domain(&self) -> &str;

    /// Current origin restrictions of a package
    fn describe_restrictions(&self, key: &PackageKey) -> Result<Restrictions>;

    /// Replace the origin restrictions of a package
    fn apply_restrictions(&self, key: &PackageKey, restrictions: Restrictions) -> Result<()>;

    /// All packages of a repository passing `filter`
    fn list_packages(&self, repository: &str, filter: &PackageFilter) -> Result<Vec<PackageSummary>>;

    /// Upstreams and external connections of a repository
    fn repository_upstreams(&self, repository: &str) -> Result<RepositoryUpstreams>;
}

impl<C: RegistryClient + ?Sized> RegistryClient for Arc<C> {
    fn domain(&self) -> &str {
        (**self).domain()
    }

    fn describe_restrictions(&self, key: &PackageKey) -> Result<Restrictions> {
        (**self).describe_restrictions(key)
    }

    fn apply_restrictions(&self, key: &PackageKey, restrictions: Restrictions) -> Result<()> {
        (**self).apply_restrictions(key, restrictions)
    }

    fn list_packages(&self, repository: &str, filter: &PackageFilter) -> Result<Vec<PackageSummary>> {
        (**self).list_packages(repository, filter)
    }

    fn repository_upstreams(&self, repository: &str) -> Result<RepositoryUpstreams> {
        (**self).repository_upstreams(repository)
    }
}

/// Fail with [`OriginError::DomainMismatch`] if a key targets another domain
pub fn ensure_domain(expected: &str, key: &PackageKey) -> Result<()> {
    if key.domain != expected {
        return Err(OriginError::DomainMismatch {
            expected: expected.to_string(),
            actual: key.domain.clone(),
        });
    }
    Ok(())
}

/// Bounds every call of an inner client by a timeout
///
/// Each call runs on a short-lived thread. When the timeout expires the
/// caller gets [`OriginError::Timeout`] and the thread is left to finish on
/// its own; its result is discarded.
#[derive(Debug)]
pub struct TimeoutClient<C> {
    inner: Arc<C>,
    timeout: Duration,
}

impl<C: RegistryClient + 'static> TimeoutClient<C> {
    /// Wrap a client
    pub fn new(inner: C, timeout: Duration) -> Self {
        Self::from_arc(Arc::new(inner), timeout)
    }

    /// Wrap a client that is already shared
    pub fn from_arc(inner: Arc<C>, timeout: Duration) -> Self {
        Self { inner, timeout }
    }

    /// Configured timeout
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    fn call<T, F>(&self, name: &str, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&C) -> Result<T> + Send + 'static,
    {
        let (tx, rx) = bounded(1);
        let inner = Arc::clone(&self.inner);
        thread::Builder::new()
            .name(format!("registry-{}", name))
            .spawn(move || {
                // Receiver may be gone after a timeout
                let _ = tx.send(f(&inner));
            })
            .map_err(|e| OriginError::ThreadPool(format!("cannot spawn registry call: {}", e)))?;

        match rx.recv_timeout(self.timeout) {
            Ok(result) => result,
            Err(RecvTimeoutError::Timeout) => {
                warn!("Registry call {} timed out after {:?}", name, self.timeout);
                Err(OriginError::Timeout(self.timeout))
            }
            Err(RecvTimeoutError::Disconnected) => {
                Err(OriginError::registry(format!("registry call {} panicked", name)))
            }
        }
    }
}

impl<C: RegistryClient + 'static> RegistryClient for TimeoutClient<C> {
    fn domain(&self) -> &str {
        self.inner.domain()
    }

    fn describe_restrictions(&self, key: &PackageKey) -> Result<Restrictions> {
        let key = key.clone();
        self.call("describe", move |c| c.describe_restrictions(&key))
    }

    fn apply_restrictions(&self, key: &PackageKey, restrictions: Restrictions) -> Result<()> {
        let key = key.clone();
        self.call("apply", move |c| c.apply_restrictions(&key, restrictions))
    }

    fn list_packages(&self, repository: &str, filter: &PackageFilter) -> Result<Vec<PackageSummary>> {
        let repository = repository.to_string();
        let filter = filter.clone();
        self.call("list", move |c| c.list_packages(&repository, &filter))
    }

    fn repository_upstreams(&self, repository: &str) -> Result<RepositoryUpstreams> {
        let repository = repository.to_string();
        self.call("upstreams", move |c| c.repository_upstreams(&repository))
    }
}

/// A package stored in a [`FileRegistry`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredPackage {
    /// Format
    pub format: String,
    /// Namespace, possibly empty
    #[serde(default)]
    pub namespace: String,
    /// Name
    pub package: String,
    /// Origin restrictions
    #[serde(default)]
    pub restrictions: Restrictions,
}

/// A repository stored in a [`FileRegistry`]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredRepository {
    /// Upstream repository names
    #[serde(default)]
    pub upstreams: Vec<String>,
    /// External connections
    #[serde(default)]
    pub external_connections: Vec<ExternalConnection>,
    /// Packages held by the repository
    #[serde(default)]
    pub packages: Vec<StoredPackage>,
}

/// Serialized state of a [`FileRegistry`]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryState {
    /// Domain of the registry
    pub domain: String,
    /// Repositories by name
    #[serde(default)]
    pub repositories: BTreeMap<String, StoredRepository>,
}

impl RegistryState {
    /// Empty registry for a domain
    pub fn new(domain: impl Into<String>) -> Self {
        Self {
            domain: domain.into(),
            repositories: BTreeMap::new(),
        }
    }

    /// Add a repository, replacing any existing one with the same name
    pub fn with_repository(mut self, name: impl Into<String>, repository: StoredRepository) -> Self {
        self.repositories.insert(name.into(), repository);
        self
    }

    fn repository(&self, name: &str) -> Result<&StoredRepository> {
        self.repositories
            .get(name)
            .ok_or_else(|| OriginError::registry(format!("repository {} not found", name)))
    }

    fn package_mut(&mut self, key: &PackageKey) -> Result<&mut StoredPackage> {
        let repository = self
            .repositories
            .get_mut(&key.repository)
            .ok_or_else(|| OriginError::registry(format!("repository {} not found", key.repository)))?;
        repository
            .packages
            .iter_mut()
            .find(|p| p.format == key.format && p.namespace == key.namespace && p.package == key.package)
            .ok_or_else(|| OriginError::registry(format!("package {} not found", key)))
    }
}

/// Offline registry backed by a JSON state file
///
/// Reads are served from memory. Every mutation is written back with an
/// atomic replace when a state file is configured.
#[derive(Debug)]
pub struct FileRegistry {
    domain: String,
    path: Option<PathBuf>,
    state: Mutex<RegistryState>,
}

impl FileRegistry {
    /// Load a registry from a JSON state file
    #[instrument]
    pub fn open(path: &Path) -> Result<Self> {
        let json = fs::read_to_string(path)?;
        let state: RegistryState = serde_json::from_str(&json)?;
        info!(
            "Loaded registry {} with {} repositories from {:?}",
            state.domain,
            state.repositories.len(),
            path
        );
        Ok(Self {
            domain: state.domain.clone(),
            path: Some(path.to_path_buf()),
            state: Mutex::new(state),
        })
    }

    /// Registry that lives only in memory
    pub fn in_memory(state: RegistryState) -> Self {
        Self {
            domain: state.domain.clone(),
            path: None,
            state: Mutex::new(state),
        }
    }

    /// Copy of the current state
    pub fn snapshot(&self) -> RegistryState {
        self.state.lock().clone()
    }

    /// Write the current state to `path` atomically
    pub fn save_to(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(&*self.state.lock())?;
        utils::atomic_write(path, json.as_bytes())
    }

    fn persist(&self, state: &RegistryState) -> Result<()> {
        if let Some(path) = &self.path {
            let json = serde_json::to_string_pretty(state)?;
            utils::atomic_write(path, json.as_bytes())?;
        }
        Ok(())
    }
}

impl RegistryClient for FileRegistry {
    fn domain(&self) -> &str {
        &self.domain
    }

    fn describe_restrictions(&self, key: &PackageKey) -> Result<Restrictions> {
        ensure_domain(&self.domain, key)?;
        let mut state = self.state.lock();
        Ok(state.package_mut(key)?.restrictions)
    }

    fn apply_restrictions(&self, key: &PackageKey, restrictions: Restrictions) -> Result<()> {
        ensure_domain(&self.domain, key)?;
        let mut state = self.state.lock();
        state.package_mut(key)?.restrictions = restrictions;
        self.persist(&state)?;
        debug!("Set {} to upstream={} publish={}", key, restrictions.upstream, restrictions.publish);
        Ok(())
    }

    fn list_packages(&self, repository: &str, filter: &PackageFilter) -> Result<Vec<PackageSummary>> {
        let state = self.state.lock();
        let mut packages: Vec<PackageSummary> = state
            .repository(repository)?
            .packages
            .iter()
            .map(|p| PackageSummary {
                format: p.format.clone(),
                namespace: p.namespace.clone(),
                package: p.package.clone(),
            })
            .filter(|p| filter.matches(p))
            .collect();
        packages.sort();
        Ok(packages)
    }

    fn repository_upstreams(&self, repository: &str) -> Result<RepositoryUpstreams> {
        let state = self.state.lock();
        let stored = state.repository(repository)?;
        Ok(RepositoryUpstreams {
            upstreams: stored
                .upstreams
                .iter()
                .filter(|u| u.as_str() != repository)
                .cloned()
                .collect(),
            external_connections: stored.external_connections.clone(),
        })
    }
}
