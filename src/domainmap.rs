//! Domain-to-route map.
//!
//! The map is owned by the supervisor thread; workers hold a read-only
//! [`DomainView`] for lookups. A reload atomically replaces the routing
//! table and fires [`changed`](DomainMap::changed) on the supervisor thread,
//! which fans a `routes_changed` notification out to every worker so caches
//! derived from the map can be refreshed.
//!
//! Route lines have the shape used by the routes file and the `--route`
//! command line option:
//!
//! ```text
//! <domain> <target>[,<target>...] [key=value ...]
//! ```
//!
//! `*` matches any domain not matched exactly. Empty lines and `#` comments
//! are skipped.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use log::{debug, warn};
use thiserror::Error;

use crate::signal::Signal;

#[derive(Debug, Error)]
pub enum RouteError {
    #[error("invalid route line: {0:?}")]
    Invalid(String),
    #[error("failed to read routes file: {0}")]
    Io(#[from] std::io::Error),
}

/// One resolved route: the targets a matched request may be proxied to, plus
/// free-form properties.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteEntry {
    pub domain: String,
    pub targets: Vec<String>,
    pub props: HashMap<String, String>,
}

fn parse_line(line: &str) -> Result<Option<RouteEntry>, RouteError> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return Ok(None);
    }

    let mut parts = line.split_whitespace();
    let domain = parts
        .next()
        .ok_or_else(|| RouteError::Invalid(line.to_string()))?;
    let targets: Vec<String> = parts
        .next()
        .ok_or_else(|| RouteError::Invalid(line.to_string()))?
        .split(',')
        .filter(|t| !t.is_empty())
        .map(str::to_string)
        .collect();
    if targets.is_empty() {
        return Err(RouteError::Invalid(line.to_string()));
    }

    let mut props = HashMap::new();
    for p in parts {
        let (k, v) = p
            .split_once('=')
            .ok_or_else(|| RouteError::Invalid(line.to_string()))?;
        props.insert(k.to_string(), v.to_string());
    }

    Ok(Some(RouteEntry {
        domain: domain.to_ascii_lowercase(),
        targets,
        props,
    }))
}

fn parse_file(path: &Path) -> Result<HashMap<String, RouteEntry>, RouteError> {
    let text = fs::read_to_string(path)?;
    let mut entries = HashMap::new();
    for line in text.lines() {
        if let Some(entry) = parse_line(line)? {
            entries.insert(entry.domain.clone(), entry);
        }
    }
    Ok(entries)
}

struct RouteData {
    entries: RwLock<HashMap<String, RouteEntry>>,
}

/// Supervisor-owned route map. Not shared across threads; workers get a
/// [`DomainView`].
pub struct DomainMap {
    data: Arc<RouteData>,
    file: Option<PathBuf>,
    /// Fired on the supervisor thread after a successful reload.
    pub changed: Signal,
}

impl DomainMap {
    /// Map backed by a routes file. The file is read on first
    /// [`reload`](Self::reload); a missing file at that point is an error.
    pub fn from_file(path: impl Into<PathBuf>) -> DomainMap {
        DomainMap {
            data: Arc::new(RouteData {
                entries: RwLock::new(HashMap::new()),
            }),
            file: Some(path.into()),
            changed: Signal::new(),
        }
    }

    /// Map with no backing file, populated through
    /// [`add_route_line`](Self::add_route_line).
    pub fn from_lines() -> DomainMap {
        DomainMap {
            data: Arc::new(RouteData {
                entries: RwLock::new(HashMap::new()),
            }),
            file: None,
            changed: Signal::new(),
        }
    }

    /// Adds one route line to the current table. Does not fire `changed`;
    /// this is initial population, not a reload.
    pub fn add_route_line(&self, line: &str) -> Result<(), RouteError> {
        if let Some(entry) = parse_line(line)? {
            self.data
                .entries
                .write()
                .unwrap()
                .insert(entry.domain.clone(), entry);
        }
        Ok(())
    }

    /// Re-reads the routes file and atomically replaces the table, firing
    /// `changed` on success. A parse or read failure keeps the previous
    /// table and does not fire.
    pub fn reload(&self) {
        let Some(path) = &self.file else {
            debug!("domain map has no routes file, reload skipped");
            return;
        };
        match parse_file(path) {
            Ok(entries) => {
                debug!("loaded {} routes from {}", entries.len(), path.display());
                *self.data.entries.write().unwrap() = entries;
                self.changed.emit();
            }
            Err(e) => warn!("failed to reload routes: {}", e),
        }
    }

    /// Read-only handle for worker threads.
    pub fn view(&self) -> DomainView {
        DomainView {
            data: self.data.clone(),
        }
    }

    pub fn route_count(&self) -> usize {
        self.data.entries.read().unwrap().len()
    }
}

/// Shared lookup handle. Lookups see the table most recently published by
/// the supervisor; workers must not mutate it and cannot.
#[derive(Clone)]
pub struct DomainView {
    data: Arc<RouteData>,
}

impl DomainView {
    /// Exact-domain match first, then the `*` wildcard entry.
    pub fn lookup(&self, domain: &str) -> Option<RouteEntry> {
        let entries = self.data.entries.read().unwrap();
        entries
            .get(&domain.to_ascii_lowercase())
            .or_else(|| entries.get("*"))
            .cloned()
    }
}
