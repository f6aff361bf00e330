//! Listen address to backend-set mappings.
//!
//! The mapping file is a small INI dialect:
//!
//! ```text
//! [options]
//! pre_resolve_workers = true     ; resolve backend hostnames once at load
//! buffer_size = 4096             ; relay chunk size in bytes
//!
//! [mappings]
//! 8080 = 10.0.0.1:9001,10.0.0.2:9001
//! 127.0.0.1:9090 = backend.internal:7000
//! ```
//!
//! Only a missing `[mappings]` section is fatal. Every other problem skips the
//! offending line or entry and is recorded as a [`ConfigWarning`].
//!
//! Parsed mappings are published through [`MappingStore`], which swaps whole
//! snapshots atomically so readers on the accept path never take a lock.

use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::io;
use std::net::{IpAddr, ToSocketAddrs};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use arc_swap::ArcSwap;
use thiserror::Error;
use tracing::{info, warn};

use crate::error::ConfigError;

/// Default relay chunk size in bytes.
pub const DEFAULT_BUFFER_SIZE: usize = 4096;

/// Address used when a listen spec is a bare port.
pub const DEFAULT_LISTEN_ADDRESS: &str = "0.0.0.0";

const OPTIONS_SECTION: &str = "options";
const MAPPINGS_SECTION: &str = "mappings";

/// One destination a connection may be relayed to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BackendTarget {
    /// Hostname or IP literal. Already an IP literal when pre-resolved.
    pub address: String,
    /// TCP port.
    pub port: u16,
}

impl BackendTarget {
    /// Create a new backend target.
    pub fn new(address: impl Into<String>, port: u16) -> Self {
        Self {
            address: address.into(),
            port,
        }
    }

    /// Whether this target is `address:port`.
    pub fn matches(&self, address: &str, port: u16) -> bool {
        self.address == address && self.port == port
    }
}

impl fmt::Display for BackendTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.address, self.port)
    }
}

/// A front-end listen address paired with its ordered backend list.
///
/// Immutable. Edits produce a new `Mapping`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mapping {
    listen_address: String,
    listen_port: u16,
    backends: Arc<[BackendTarget]>,
}

impl Mapping {
    /// Create a mapping. Backend order is preserved for round-robin.
    pub fn new(
        listen_address: impl Into<String>,
        listen_port: u16,
        backends: Vec<BackendTarget>,
    ) -> Self {
        Self {
            listen_address: listen_address.into(),
            listen_port,
            backends: backends.into(),
        }
    }

    /// Lookup key, `"address:port"`.
    pub fn key(&self) -> String {
        mapping_key(&self.listen_address, self.listen_port)
    }

    pub fn listen_address(&self) -> &str {
        &self.listen_address
    }

    pub fn listen_port(&self) -> u16 {
        self.listen_port
    }

    /// Backends in declaration order.
    pub fn backends(&self) -> &[BackendTarget] {
        &self.backends
    }

    /// Number of backends.
    pub fn len(&self) -> usize {
        self.backends.len()
    }

    pub fn is_empty(&self) -> bool {
        self.backends.is_empty()
    }

    /// Backend at a round-robin index (taken modulo the list length).
    pub fn backend_at(&self, index: usize) -> Option<&BackendTarget> {
        if self.backends.is_empty() {
            return None;
        }
        self.backends.get(index % self.backends.len())
    }

    /// A copy of this mapping with `target` appended.
    pub fn with_backend(&self, target: BackendTarget) -> Self {
        let mut backends = self.backends.to_vec();
        backends.push(target);
        Self {
            listen_address: self.listen_address.clone(),
            listen_port: self.listen_port,
            backends: backends.into(),
        }
    }

    /// A copy of this mapping without `address:port`, plus the removed target.
    pub fn without_backend(&self, address: &str, port: u16) -> (Self, Option<BackendTarget>) {
        let mut removed = None;
        let backends: Vec<BackendTarget> = self
            .backends
            .iter()
            .filter(|b| {
                if b.matches(address, port) {
                    removed = Some((*b).clone());
                    false
                } else {
                    true
                }
            })
            .cloned()
            .collect();

        (
            Self {
                listen_address: self.listen_address.clone(),
                listen_port: self.listen_port,
                backends: backends.into(),
            },
            removed,
        )
    }
}

/// Build the lookup key for a listen address.
pub fn mapping_key(address: &str, port: u16) -> String {
    format!("{}:{}", address, port)
}

/// Values from the `[options]` section.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LbOptions {
    /// Resolve backend hostnames once at load time instead of per connection.
    pub pre_resolve_workers: bool,
    /// Relay chunk size in bytes.
    pub buffer_size: usize,
}

impl Default for LbOptions {
    fn default() -> Self {
        Self {
            pre_resolve_workers: true,
            buffer_size: DEFAULT_BUFFER_SIZE,
        }
    }
}

/// A non-fatal problem found while parsing. `line` is 1-based.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigWarning {
    #[error("line {line}: entry outside of any section")]
    OutsideSection { line: usize },

    #[error("line {line}: unknown section [{name}] ignored")]
    UnknownSection { line: usize, name: String },

    #[error("line {line}: malformed line \"{text}\"")]
    MalformedLine { line: usize, text: String },

    #[error("line {line}: unknown option \"{key}\"")]
    UnknownOption { line: usize, key: String },

    #[error("line {line}: invalid value \"{value}\" for {key}, retaining \"{retained}\"")]
    InvalidOptionValue {
        line: usize,
        key: String,
        value: String,
        retained: String,
    },

    #[error("line {line}: invalid listen spec \"{spec}\"")]
    InvalidListenSpec { line: usize, spec: String },

    #[error("line {line}: no backends defined for {spec}")]
    NoBackendsDefined { line: usize, spec: String },

    #[error("line {line}: invalid backend \"{entry}\": {reason}")]
    InvalidBackend {
        line: usize,
        entry: String,
        reason: &'static str,
    },

    #[error("line {line}: could not resolve backend host \"{host}\"")]
    UnresolvableBackend { line: usize, host: String },

    #[error("line {line}: mapping {spec} has no valid backends")]
    NoValidBackends { line: usize, spec: String },

    #[error("line {line}: overriding existing mapping {key}")]
    DuplicateMapping { line: usize, key: String },
}

/// Hostname resolution used when `pre_resolve_workers` is set.
pub trait Resolver: Send + Sync {
    /// Resolve `host` to a single address, or `None` if it cannot be resolved.
    fn resolve(&self, host: &str) -> Option<IpAddr>;
}

/// Resolver backed by the system's `getaddrinfo`. Prefers IPv4 results.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemResolver;

impl Resolver for SystemResolver {
    fn resolve(&self, host: &str) -> Option<IpAddr> {
        if let Ok(ip) = host.parse::<IpAddr>() {
            return Some(ip);
        }

        let addrs: Vec<IpAddr> = (host, 0)
            .to_socket_addrs()
            .ok()?
            .map(|addr| addr.ip())
            .collect();

        addrs
            .iter()
            .copied()
            .find(IpAddr::is_ipv4)
            .or_else(|| addrs.first().copied())
    }
}

/// Result of parsing a mapping file.
#[derive(Debug, Clone, Default)]
pub struct LoadReport {
    pub options: LbOptions,
    /// Mappings keyed by `"address:port"`.
    pub mappings: BTreeMap<String, Mapping>,
    pub warnings: Vec<ConfigWarning>,
}

struct Entry<'a> {
    line: usize,
    key: &'a str,
    value: &'a str,
}

/// Parse mapping-file text.
///
/// Fails only when the `[mappings]` section is absent.
pub fn parse(text: &str, resolver: &dyn Resolver) -> Result<LoadReport, ConfigError> {
    let mut report = LoadReport::default();
    let mut options = Vec::new();
    let mut mappings = Vec::new();
    let mut has_mappings = false;

    // None: before any section. Some(None): inside an unknown section.
    let mut section: Option<Option<&'static str>> = None;

    for (idx, raw) in text.lines().enumerate() {
        let line = idx + 1;
        let trimmed = raw.trim();
        if trimmed.is_empty() || trimmed.starts_with(';') || trimmed.starts_with('#') {
            continue;
        }
        let content = strip_inline_comment(trimmed);

        if let Some(name) = content
            .strip_prefix('[')
            .and_then(|rest| rest.strip_suffix(']'))
        {
            let name = name.trim().to_ascii_lowercase();
            section = Some(match name.as_str() {
                OPTIONS_SECTION => Some(OPTIONS_SECTION),
                MAPPINGS_SECTION => {
                    has_mappings = true;
                    Some(MAPPINGS_SECTION)
                }
                _ => {
                    report
                        .warnings
                        .push(ConfigWarning::UnknownSection { line, name });
                    None
                }
            });
            continue;
        }

        let Some((key, value)) = content.split_once('=') else {
            report.warnings.push(ConfigWarning::MalformedLine {
                line,
                text: content.to_string(),
            });
            continue;
        };
        let entry = Entry {
            line,
            key: key.trim(),
            value: value.trim(),
        };

        match section {
            None => report.warnings.push(ConfigWarning::OutsideSection { line }),
            Some(Some(OPTIONS_SECTION)) => options.push(entry),
            Some(Some(_)) => mappings.push(entry),
            Some(None) => {}
        }
    }

    if !has_mappings {
        return Err(ConfigError::MissingSection(MAPPINGS_SECTION));
    }

    // Options first: pre_resolve_workers decides how mapping lines are read.
    for entry in &options {
        apply_option(&mut report.options, entry, &mut report.warnings);
    }
    for entry in &mappings {
        parse_mapping(entry, report.options, resolver, &mut report);
    }

    Ok(report)
}

fn strip_inline_comment(line: &str) -> &str {
    let mut prev_ws = false;
    for (i, c) in line.char_indices() {
        if (c == ';' || c == '#') && prev_ws {
            return line[..i].trim_end();
        }
        prev_ws = c.is_whitespace();
    }
    line
}

fn apply_option(options: &mut LbOptions, entry: &Entry<'_>, warnings: &mut Vec<ConfigWarning>) {
    let key = entry.key.to_ascii_lowercase();
    match key.as_str() {
        "pre_resolve_workers" => match parse_bool(entry.value) {
            Some(value) => options.pre_resolve_workers = value,
            None => warnings.push(ConfigWarning::InvalidOptionValue {
                line: entry.line,
                key,
                value: entry.value.to_string(),
                retained: options.pre_resolve_workers.to_string(),
            }),
        },
        "buffer_size" => match entry.value.parse::<usize>() {
            Ok(size) if size > 0 => options.buffer_size = size,
            _ => warnings.push(ConfigWarning::InvalidOptionValue {
                line: entry.line,
                key,
                value: entry.value.to_string(),
                retained: options.buffer_size.to_string(),
            }),
        },
        _ => warnings.push(ConfigWarning::UnknownOption {
            line: entry.line,
            key,
        }),
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn parse_port(value: &str) -> Option<u16> {
    match value.trim().parse::<u16>() {
        Ok(0) | Err(_) => None,
        Ok(port) => Some(port),
    }
}

fn parse_mapping(
    entry: &Entry<'_>,
    options: LbOptions,
    resolver: &dyn Resolver,
    report: &mut LoadReport,
) {
    let line = entry.line;
    let spec = entry.key;

    if entry.value.is_empty() {
        report.warnings.push(ConfigWarning::NoBackendsDefined {
            line,
            spec: spec.to_string(),
        });
        return;
    }

    let parts: Vec<&str> = spec.split(':').collect();
    let (address, port) = match parts.as_slice() {
        [port] => (DEFAULT_LISTEN_ADDRESS, parse_port(port)),
        [address, port] => {
            let address = address.trim();
            let address = if address.is_empty() {
                DEFAULT_LISTEN_ADDRESS
            } else {
                address
            };
            (address, parse_port(port))
        }
        _ => (DEFAULT_LISTEN_ADDRESS, None),
    };
    let Some(port) = port else {
        report.warnings.push(ConfigWarning::InvalidListenSpec {
            line,
            spec: spec.to_string(),
        });
        return;
    };

    let mut backends = Vec::new();
    for raw in entry.value.split(',') {
        let raw = raw.trim();
        if let Some(target) = parse_backend(line, raw, options, resolver, &mut report.warnings) {
            backends.push(target);
        }
    }

    if backends.is_empty() {
        report.warnings.push(ConfigWarning::NoValidBackends {
            line,
            spec: spec.to_string(),
        });
        return;
    }

    let mapping = Mapping::new(address, port, backends);
    let key = mapping.key();
    if report.mappings.contains_key(&key) {
        report.warnings.push(ConfigWarning::DuplicateMapping {
            line,
            key: key.clone(),
        });
    }
    report.mappings.insert(key, mapping);
}

fn parse_backend(
    line: usize,
    raw: &str,
    options: LbOptions,
    resolver: &dyn Resolver,
    warnings: &mut Vec<ConfigWarning>,
) -> Option<BackendTarget> {
    let invalid = |reason| ConfigWarning::InvalidBackend {
        line,
        entry: raw.to_string(),
        reason,
    };

    let Some((host, port)) = raw.split_once(':') else {
        warnings.push(invalid("expected address:port"));
        return None;
    };
    let host = host.trim();
    if host.is_empty() {
        warnings.push(invalid("empty address"));
        return None;
    }
    if port.contains(':') {
        warnings.push(invalid("expected address:port"));
        return None;
    }
    let Some(port) = parse_port(port) else {
        warnings.push(invalid("could not parse port"));
        return None;
    };

    let address = if options.pre_resolve_workers {
        match resolver.resolve(host) {
            Some(ip) => ip.to_string(),
            None => {
                warnings.push(ConfigWarning::UnresolvableBackend {
                    line,
                    host: host.to_string(),
                });
                return None;
            }
        }
    } else {
        host.to_string()
    };

    Some(BackendTarget::new(address, port))
}

/// Immutable snapshot of all mappings.
#[derive(Debug, Default)]
struct MappingSnapshot {
    options: LbOptions,
    mappings: BTreeMap<String, Arc<Mapping>>,
}

impl MappingSnapshot {
    fn from_report(report: LoadReport) -> Self {
        Self {
            options: report.options,
            mappings: report
                .mappings
                .into_iter()
                .map(|(key, mapping)| (key, Arc::new(mapping)))
                .collect(),
        }
    }
}

/// Listen keys that changed across a reload.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReloadOutcome {
    /// Keys present after the reload but not before. These need a restart to be bound.
    pub added: Vec<String>,
    /// Keys no longer present. Their listeners stay bound but close new connections.
    pub removed: Vec<String>,
    pub warnings: Vec<ConfigWarning>,
}

/// Holds the current mapping snapshot.
///
/// Uses ArcSwap so the accept path reads without blocking. Every edit builds a
/// new snapshot and swaps it in.
pub struct MappingStore {
    snapshot: ArcSwap<MappingSnapshot>,
    resolver: Arc<dyn Resolver>,
}

impl MappingStore {
    /// Parse `text` with the system resolver.
    pub fn load(text: &str) -> Result<(Self, Vec<ConfigWarning>), ConfigError> {
        Self::load_with(text, Arc::new(SystemResolver))
    }

    /// Parse `text` with a custom resolver. The resolver is kept for reloads.
    pub fn load_with(
        text: &str,
        resolver: Arc<dyn Resolver>,
    ) -> Result<(Self, Vec<ConfigWarning>), ConfigError> {
        let mut report = parse(text, resolver.as_ref())?;
        log_warnings(&report.warnings);
        let warnings = std::mem::take(&mut report.warnings);

        info!(
            mapping_count = report.mappings.len(),
            buffer_size = report.options.buffer_size,
            pre_resolve_workers = report.options.pre_resolve_workers,
            "Mappings loaded"
        );

        let store = Self {
            snapshot: ArcSwap::from_pointee(MappingSnapshot::from_report(report)),
            resolver,
        };
        Ok((store, warnings))
    }

    /// Read and parse a mapping file.
    pub fn load_file(path: &Path) -> Result<(Self, Vec<ConfigWarning>), ConfigError> {
        let text = read_config(path)?;
        Self::load(&text)
    }

    /// Current options.
    pub fn options(&self) -> LbOptions {
        self.snapshot.load().options
    }

    /// Mapping for a listen key.
    pub fn get(&self, key: &str) -> Option<Arc<Mapping>> {
        self.snapshot.load().mappings.get(key).cloned()
    }

    /// All mappings, ordered by key.
    pub fn mappings(&self) -> Vec<Arc<Mapping>> {
        self.snapshot.load().mappings.values().cloned().collect()
    }

    /// All listen keys, ordered.
    pub fn keys(&self) -> Vec<String> {
        self.snapshot.load().mappings.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.snapshot.load().mappings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshot.load().mappings.is_empty()
    }

    /// Append a backend to a mapping. Returns false if the key is unknown.
    pub fn add_backend(&self, key: &str, target: BackendTarget) -> bool {
        let mut found = false;
        self.snapshot.rcu(|current| {
            let mut mappings = current.mappings.clone();
            found = match mappings.get(key) {
                Some(mapping) => {
                    let updated = mapping.with_backend(target.clone());
                    mappings.insert(key.to_string(), Arc::new(updated));
                    true
                }
                None => false,
            };
            MappingSnapshot {
                options: current.options,
                mappings,
            }
        });

        if found {
            info!(listen = %key, backend = %target, "Backend added");
        }
        found
    }

    /// Remove `address:port` from a mapping, returning the removed target.
    ///
    /// Connections already relaying to the backend are unaffected.
    pub fn remove_backend(&self, key: &str, address: &str, port: u16) -> Option<BackendTarget> {
        let mut removed = None;
        self.snapshot.rcu(|current| {
            let mut mappings = current.mappings.clone();
            removed = None;
            if let Some(mapping) = mappings.get(key) {
                let (updated, target) = mapping.without_backend(address, port);
                if target.is_some() {
                    mappings.insert(key.to_string(), Arc::new(updated));
                }
                removed = target;
            }
            MappingSnapshot {
                options: current.options,
                mappings,
            }
        });

        if let Some(target) = &removed {
            info!(listen = %key, backend = %target, "Backend removed");
        }
        removed
    }

    /// Re-parse `text` and replace the whole snapshot.
    ///
    /// On error the previous snapshot stays in place.
    pub fn reload(&self, text: &str) -> Result<ReloadOutcome, ConfigError> {
        let mut report = parse(text, self.resolver.as_ref())?;
        log_warnings(&report.warnings);

        let previous = self.snapshot.load();
        let added = report
            .mappings
            .keys()
            .filter(|key| !previous.mappings.contains_key(*key))
            .cloned()
            .collect();
        let removed = previous
            .mappings
            .keys()
            .filter(|key| !report.mappings.contains_key(*key))
            .cloned()
            .collect();

        let warnings = std::mem::take(&mut report.warnings);
        let mapping_count = report.mappings.len();
        self.snapshot
            .store(Arc::new(MappingSnapshot::from_report(report)));

        info!(mapping_count, "Mappings reloaded atomically");

        Ok(ReloadOutcome {
            added,
            removed,
            warnings,
        })
    }

    /// Re-read a mapping file and replace the snapshot.
    pub fn reload_file(&self, path: &Path) -> Result<ReloadOutcome, ConfigError> {
        let text = read_config(path)?;
        self.reload(&text)
    }

    /// [`reload_file`](Self::reload_file) on the blocking thread pool.
    ///
    /// Reading the file and resolving backend hostnames both block.
    pub async fn reload_file_in_background(
        self: Arc<Self>,
        path: PathBuf,
    ) -> Result<ReloadOutcome, ConfigError> {
        let task_path = path.clone();
        tokio::task::spawn_blocking(move || self.reload_file(&task_path))
            .await
            .map_err(|e| ConfigError::Io {
                path,
                source: io::Error::other(e),
            })?
    }
}

fn read_config(path: &Path) -> Result<String, ConfigError> {
    fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })
}

fn log_warnings(warnings: &[ConfigWarning]) {
    for warning in warnings {
        warn!(warning = %warning, "Config warning");
    }
}
