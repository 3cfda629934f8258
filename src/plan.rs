//! Restriction plan generation
//!
//! A plan is an input file for an apply run: one [`PackageRecord`] per
//! package with the restrictions it should get. Plans are generated in one of
//! three modes:
//!
//! - **from list**: package names come from a local file and every package
//!   gets the same explicit restrictions. No registry call is made.
//! - **manual**: packages are listed from the repository (optionally
//!   filtered) and every package gets the same explicit restrictions.
//! - **automatic**: packages are listed (or read from a file) and the
//!   restrictions are derived from the repository topology, see
//!   [`block_where_possible`].

use crate::error::{OriginError, Result};
use crate::registry::{PackageFilter, PackageSummary, RegistryClient, RepositoryUpstreams};
use crate::types::{PackageKey, PackageRecord, Restriction, Restrictions, CSV_HEADER};
use std::collections::{BTreeMap, HashSet};
use std::fs::File;
use std::path::{Path, PathBuf};
use tracing::{debug, info, instrument};

/// Parse a restriction string of the form `publish=ALLOW,upstream=BLOCK`
///
/// Both flags must appear exactly once, in any order, with surrounding
/// whitespace ignored.
pub fn parse_restrictions(input: &str) -> Result<Restrictions> {
    let sections: Vec<&str> = input.trim().split(',').collect();
    if sections.len() != 2 {
        return Err(OriginError::InvalidRestriction(
            "Check number of arguments provided (should be 2)".to_string(),
        ));
    }

    let mut upstream = None;
    let mut publish = None;
    for section in sections {
        let (name, value) = section.trim().split_once('=').ok_or_else(|| {
            OriginError::InvalidRestriction(format!("{} is not of the form flag=value", section.trim()))
        })?;
        let slot = match name.trim() {
            "upstream" => &mut upstream,
            "publish" => &mut publish,
            other => {
                return Err(OriginError::InvalidRestriction(format!(
                    "{} not a valid origin control flag",
                    other
                )))
            }
        };
        if slot.is_some() {
            return Err(OriginError::InvalidRestriction(format!(
                "{} given more than once",
                name.trim()
            )));
        }
        let value: Restriction = value.trim().parse().map_err(|_| {
            OriginError::InvalidRestriction(format!("{} not allowed for {}", value.trim(), name.trim()))
        })?;
        *slot = Some(value);
    }

    match (upstream, publish) {
        (Some(upstream), Some(publish)) => Ok(Restrictions { upstream, publish }),
        _ => Err(OriginError::internal("flag parsing lost a value")),
    }
}

/// Transitive upstreams of a repository
///
/// Maps every reachable repository (the start included) to its direct
/// upstreams. Traversal uses an explicit stack; the visited set stops cycles.
#[instrument(skip(client))]
pub fn upstream_graph(client: &dyn RegistryClient, repository: &str) -> Result<BTreeMap<String, Vec<String>>> {
    let mut graph = BTreeMap::new();
    let mut visited = HashSet::new();
    let mut stack = vec![repository.to_string()];

    while let Some(current) = stack.pop() {
        if !visited.insert(current.clone()) {
            continue;
        }
        let upstreams: Vec<String> = client
            .repository_upstreams(&current)?
            .upstreams
            .into_iter()
            .filter(|u| *u != current)
            .collect();
        for upstream in upstreams.iter().rev() {
            if !visited.contains(upstream) {
                stack.push(upstream.clone());
            }
        }
        graph.insert(current, upstreams);
    }

    debug!("Upstream graph of {} has {} repositories", repository, graph.len());
    Ok(graph)
}

/// Decide the restrictions of each candidate package
///
/// Upstream versions are blocked for a package if and only if the repository
/// has no external connection for its format and none of the upstream
/// repositories carries it. Every other package keeps both origins allowed.
///
/// Allowed packages come first in the result, followed by blocked ones.
pub fn block_where_possible(
    candidates: &[PackageSummary],
    carried_by_upstreams: &HashSet<PackageSummary>,
    repository: &RepositoryUpstreams,
) -> Vec<(PackageSummary, Restrictions)> {
    let (allowed, blocked): (Vec<_>, Vec<_>) = candidates.iter().cloned().partition(|package| {
        repository.has_external_connection_for(&package.format)
            || carried_by_upstreams.contains(package)
    });

    allowed
        .into_iter()
        .map(|p| (p, Restrictions::ALLOW_ALL))
        .chain(blocked.into_iter().map(|p| (p, Restrictions::UPSTREAM_BLOCKED)))
        .collect()
}

/// Parameters of a generation run
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PlanRequest {
    /// Registry domain
    pub domain: String,
    /// Target repository
    pub repository: String,
    /// Format, namespace and prefix filters
    pub filter: PackageFilter,
    /// Explicit restrictions for every package; automatic mode when absent
    pub restrictions: Option<Restrictions>,
    /// File with one package name per line
    pub from_list: Option<PathBuf>,
}

impl PlanRequest {
    /// Check option combinations
    pub fn validate(&self) -> Result<()> {
        if self.filter.format.is_none() {
            if self.from_list.is_some() {
                return Err(OriginError::InvalidConfiguration(
                    "List-only requires package format".to_string(),
                ));
            }
            if self.filter.namespace.is_some() {
                return Err(OriginError::InvalidConfiguration(
                    "Namespace requires package format".to_string(),
                ));
            }
        }
        Ok(())
    }

    /// Whether this request can be served without a registry
    pub fn is_offline(&self) -> bool {
        self.from_list.is_some() && self.restrictions.is_some()
    }

    fn record(&self, package: &PackageSummary, restrictions: Restrictions) -> PackageRecord {
        PackageRecord::new(
            PackageKey {
                domain: self.domain.clone(),
                repository: self.repository.clone(),
                format: package.format.clone(),
                namespace: package.namespace.clone(),
                package: package.package.clone(),
            },
            restrictions,
        )
    }

    /// Packages named in the list file, with the requested format and namespace
    fn listed_packages(&self, path: &Path) -> Result<Vec<PackageSummary>> {
        let format = self.filter.format.clone().unwrap_or_default();
        let namespace = self.filter.namespace.clone().unwrap_or_default();
        Ok(read_package_list(path)?
            .into_iter()
            .map(|package| PackageSummary {
                format: format.clone(),
                namespace: namespace.clone(),
                package,
            })
            .collect())
    }
}

/// Default plan filename for a repository
pub fn default_output_name(domain: &str, repository: &str) -> String {
    format!("origin_configuration_{}_{}.csv", domain, repository)
}

/// Read package names from the first column of a header-less CSV file
///
/// Blank lines are skipped.
pub fn read_package_list(path: &Path) -> Result<Vec<String>> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_path(path)?;
    let mut names = Vec::new();
    for row in reader.records() {
        let row = row?;
        if let Some(name) = row.get(0).map(str::trim).filter(|n| !n.is_empty()) {
            names.push(name.to_string());
        }
    }
    Ok(names)
}

/// Generate a plan
///
/// `client` may be `None` only for offline requests (from list with
/// explicit restrictions).
#[instrument(skip(client), fields(domain = %request.domain, repository = %request.repository))]
pub fn generate(client: Option<&dyn RegistryClient>, request: &PlanRequest) -> Result<Vec<PackageRecord>> {
    request.validate()?;

    if let (Some(path), Some(restrictions)) = (&request.from_list, request.restrictions) {
        let records: Vec<PackageRecord> = request
            .listed_packages(path)?
            .iter()
            .map(|p| request.record(p, restrictions))
            .collect();
        info!("Generated {} records from {:?}", records.len(), path);
        return Ok(records);
    }

    let client = client.ok_or_else(|| {
        OriginError::InvalidConfiguration("a registry is required for this generation mode".to_string())
    })?;
    if client.domain() != request.domain {
        return Err(OriginError::DomainMismatch {
            expected: client.domain().to_string(),
            actual: request.domain.clone(),
        });
    }

    if let Some(restrictions) = request.restrictions {
        let packages = client.list_packages(&request.repository, &request.filter)?;
        info!("Applying the same restrictions to {} packages", packages.len());
        return Ok(packages
            .iter()
            .map(|p| request.record(p, restrictions))
            .collect());
    }

    generate_automatic(client, request)
}

fn generate_automatic(client: &dyn RegistryClient, request: &PlanRequest) -> Result<Vec<PackageRecord>> {
    let candidates = match &request.from_list {
        Some(path) => request.listed_packages(path)?,
        None => client.list_packages(&request.repository, &request.filter)?,
    };
    let repository = client.repository_upstreams(&request.repository)?;

    let mut carried = HashSet::new();
    if !repository.upstreams.is_empty() {
        let wanted: HashSet<&PackageSummary> = candidates.iter().collect();
        for upstream in upstream_graph(client, &request.repository)?.keys() {
            if *upstream == request.repository {
                continue;
            }
            for package in client.list_packages(upstream, &request.filter)? {
                if wanted.contains(&package) {
                    carried.insert(package);
                }
            }
        }
    }

    let decided = block_where_possible(&candidates, &carried, &repository);
    let blocked = decided
        .iter()
        .filter(|(_, r)| *r == Restrictions::UPSTREAM_BLOCKED)
        .count();
    info!(
        "{} of {} packages can have upstream versions blocked",
        blocked,
        decided.len()
    );
    Ok(decided
        .iter()
        .map(|(p, r)| request.record(p, *r))
        .collect())
}

/// Write a plan as CSV with a header, returning the number of rows
pub fn write_plan(path: &Path, records: &[PackageRecord]) -> Result<usize> {
    let mut writer = csv::WriterBuilder::new()
        .has_headers(false)
        .from_writer(File::create(path)?);
    writer.write_record(CSV_HEADER)?;
    for record in records {
        writer.write_record(record.to_fields())?;
    }
    writer.flush()?;
    info!("Wrote {} records to {:?}", records.len(), path);
    Ok(records.len())
}
