//! Operation registry.
//!
//! Loaded once at startup from `<config>/ops.d`. Every regular file in that
//! directory holds line-oriented records:
//!
//! ```text
//! # host                          operation   type
//! caffeine.csclub.uwaterloo.ca    adduser     0x1
//! mail.csclub.uwaterloo.ca        mail        0x4
//! ```
//!
//! The type tag accepts decimal, `0x` hex and leading-zero octal. A record
//! is local when its host resolves to this machine's canonical name; local
//! records must have an executable `<lib>/op-<name>`. A client owns
//! nothing, so [`LoadMode::Client`] skips locality and executable checks.
//!
//! The registry is immutable after [`Registry::load`] and is inherited by
//! every connection worker.

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::io;
use std::net::IpAddr;
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};

use nix::unistd::{AccessFlags, access};
use thiserror::Error;
use tracing::{debug, warn};

use crate::config::Paths;
use crate::protocol::is_reserved_type;
use crate::resolve::HostResolver;

/// Registry configuration errors. All are fatal at startup.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// The registry directory could not be listed.
    #[error("cannot read operation directory {path}: {source}")]
    Directory {
        /// Directory path.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: io::Error,
    },

    /// A line does not hold exactly three words.
    #[error("{file}: expected three words on line {line}")]
    FieldCount {
        /// File containing the line.
        file: PathBuf,
        /// 1-based line number.
        line: usize,
    },

    /// The type tag is not an integer.
    #[error("{file}: invalid id '{value}' on line {line}")]
    InvalidType {
        /// File containing the line.
        file: PathBuf,
        /// 1-based line number.
        line: usize,
        /// Rejected text.
        value: String,
    },

    /// The type tag is reserved by the protocol.
    #[error("cannot add op {name}: type {msg_type:#x} is reserved")]
    ReservedType {
        /// Operation name.
        name: String,
        /// Rejected type.
        msg_type: u32,
    },

    /// Two records share a name.
    #[error("duplicate operation name {name}")]
    DuplicateName {
        /// Repeated name.
        name: String,
    },

    /// Two records share a type tag.
    #[error("duplicate operation type {msg_type:#x} ({first} and {second})")]
    DuplicateType {
        /// Repeated type.
        msg_type: u32,
        /// First operation with the type.
        first: String,
        /// Second operation with the type.
        second: String,
    },

    /// The owning host does not resolve.
    #[error("cannot add op {name}: {host}: {source}")]
    Resolve {
        /// Operation name.
        name: String,
        /// Host that failed.
        host: String,
        /// Resolver error.
        #[source]
        source: io::Error,
    },

    /// This machine's canonical name could not be determined.
    #[error("cannot determine local host name: {0}")]
    LocalHost(#[source] io::Error),

    /// A local operation has no executable.
    #[error("cannot add op: {name}: {} is not executable", path.display())]
    NotExecutable {
        /// Operation name.
        name: String,
        /// Expected executable path.
        path: PathBuf,
    },

    /// A run-as user does not exist.
    #[error("run-as user {user} for op {name} does not exist")]
    UnknownUser {
        /// Operation name.
        name: String,
        /// User name.
        user: String,
    },
}

/// Identity a local operation runs as.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunAs {
    /// User name.
    pub user: String,
    /// Numeric user id.
    pub uid: u32,
    /// Primary group id.
    pub gid: u32,
}

/// One registered operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Operation {
    /// Name clients look operations up by.
    pub name: String,
    /// Wire type tag.
    pub msg_type: u32,
    /// Canonical name of the owning host.
    pub host: String,
    /// Address of the owning host.
    pub addr: IpAddr,
    /// Whether this machine owns the operation. Always `false` in a
    /// registry loaded with [`LoadMode::Client`].
    pub local: bool,
    /// Executable path, set only for local operations.
    pub path: Option<PathBuf>,
    /// Identity to run as, if configured.
    pub run_as: Option<RunAs>,
}

/// A parsed but unresolved registry line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    /// Owning host as written.
    pub host: String,
    /// Operation name.
    pub name: String,
    /// Type tag.
    pub msg_type: u32,
}

/// Which side of the connection the registry is loaded for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadMode {
    /// The daemon: local operations need an executable and an existing
    /// run-as user.
    Daemon,
    /// A client: only names, types and owning hosts are needed.
    Client,
}

/// The process-wide operation table.
#[derive(Debug, Clone, Default)]
pub struct Registry {
    ops: Vec<Operation>,
    by_name: HashMap<String, usize>,
    by_type: HashMap<u32, usize>,
}

impl Registry {
    /// Load and validate every record under `<config>/ops.d`.
    ///
    /// Files are read in name order. Hidden files are skipped; unreadable
    /// entries are logged and skipped.
    ///
    /// # Errors
    ///
    /// Returns the first configuration error found. Nothing is partially
    /// loaded.
    pub fn load(
        paths: &Paths,
        resolver: &dyn HostResolver,
        run_as: &BTreeMap<String, String>,
        mode: LoadMode,
    ) -> Result<Self, RegistryError> {
        let dir = paths.ops_dir();
        let mut names: Vec<PathBuf> = fs::read_dir(&dir)
            .map_err(|source| RegistryError::Directory {
                path: dir.clone(),
                source,
            })?
            .filter_map(|entry| match entry {
                Ok(entry) => Some(entry.path()),
                Err(e) => {
                    warn!(dir = %dir.display(), error = %e, "skipping unreadable entry");
                    None
                },
            })
            .filter(|path| {
                !path
                    .file_name()
                    .is_some_and(|n| n.as_bytes().starts_with(b"."))
            })
            .collect();
        names.sort();

        let mut records = Vec::new();
        for path in names {
            match fs::read_to_string(&path) {
                Ok(content) => records.extend(parse_records(&path, &content)?),
                Err(e) => warn!(file = %path.display(), error = %e, "open failed; skipping"),
            }
        }

        match mode {
            LoadMode::Daemon => {
                let fqdn = resolver.local_fqdn().map_err(RegistryError::LocalHost)?;
                Self::build(records, paths, Some(&fqdn), resolver, run_as)
            },
            LoadMode::Client => Self::build(records, paths, None, resolver, run_as),
        }
    }

    /// Resolve and validate parsed records.
    ///
    /// `fqdn` is this machine's canonical name. With `None` no record is
    /// local, so no executable or run-as user is checked.
    ///
    /// # Errors
    ///
    /// Returns a [`RegistryError`] for reserved or duplicate types, duplicate
    /// names, unresolvable hosts, missing executables or unknown run-as
    /// users.
    pub fn build(
        records: Vec<Record>,
        paths: &Paths,
        fqdn: Option<&str>,
        resolver: &dyn HostResolver,
        run_as: &BTreeMap<String, String>,
    ) -> Result<Self, RegistryError> {
        let mut registry = Self::default();

        for record in records {
            if is_reserved_type(record.msg_type) {
                return Err(RegistryError::ReservedType {
                    name: record.name,
                    msg_type: record.msg_type,
                });
            }
            if registry.by_name.contains_key(&record.name) {
                return Err(RegistryError::DuplicateName { name: record.name });
            }
            if let Some(&idx) = registry.by_type.get(&record.msg_type) {
                return Err(RegistryError::DuplicateType {
                    msg_type: record.msg_type,
                    first: registry.ops[idx].name.clone(),
                    second: record.name,
                });
            }

            let resolved = resolver
                .resolve(&record.host)
                .map_err(|source| RegistryError::Resolve {
                    name: record.name.clone(),
                    host: record.host.clone(),
                    source,
                })?;
            let local = fqdn == Some(resolved.canonical.as_str());

            let path = if local {
                let path = paths.op_path(&record.name);
                if !is_executable(&path) {
                    return Err(RegistryError::NotExecutable {
                        name: record.name,
                        path,
                    });
                }
                Some(path)
            } else {
                None
            };

            let run_as = match (local, run_as.get(&record.name)) {
                (true, Some(user)) => Some(lookup_user(&record.name, user)?),
                (false, Some(user)) if fqdn.is_some() => {
                    warn!(op = %record.name, user = %user, "run-as ignored for remote op");
                    None
                },
                _ => None,
            };

            debug!(
                op = %record.name,
                msg_type = record.msg_type,
                "added op {} ({})",
                record.name,
                if local { "local".to_string() } else { format!("on {}", record.host) }
            );

            let idx = registry.ops.len();
            registry.by_name.insert(record.name.clone(), idx);
            registry.by_type.insert(record.msg_type, idx);
            registry.ops.push(Operation {
                name: record.name,
                msg_type: record.msg_type,
                host: resolved.canonical,
                addr: resolved.addr,
                local,
                path,
                run_as,
            });
        }

        for name in run_as.keys() {
            if fqdn.is_some() && !registry.by_name.contains_key(name) {
                warn!(op = %name, "run-as configured for unknown op");
            }
        }

        Ok(registry)
    }

    /// Look an operation up by name, local or remote.
    #[must_use]
    pub fn get_by_name(&self, name: &str) -> Option<&Operation> {
        self.by_name.get(name).map(|&idx| &self.ops[idx])
    }

    /// Look a locally owned operation up by type tag.
    #[must_use]
    pub fn get_local_by_type(&self, msg_type: u32) -> Option<&Operation> {
        self.by_type
            .get(&msg_type)
            .map(|&idx| &self.ops[idx])
            .filter(|op| op.local)
    }

    /// All operations in load order.
    pub fn iter(&self) -> impl Iterator<Item = &Operation> {
        self.ops.iter()
    }

    /// Number of operations.
    #[must_use]
    pub fn len(&self) -> usize {
        self.ops.len()
    }

    /// Returns `true` if no operation is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}

/// Parse the records of one registry file.
///
/// # Errors
///
/// Returns [`RegistryError::FieldCount`] or [`RegistryError::InvalidType`]
/// naming `file` and the line.
pub fn parse_records(file: &Path, content: &str) -> Result<Vec<Record>, RegistryError> {
    let mut records = Vec::new();
    for (idx, raw) in content.lines().enumerate() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let words: Vec<&str> = line.split_whitespace().collect();
        let &[host, name, id] = words.as_slice() else {
            return Err(RegistryError::FieldCount {
                file: file.to_path_buf(),
                line: idx + 1,
            });
        };
        let msg_type = parse_type(id).ok_or_else(|| RegistryError::InvalidType {
            file: file.to_path_buf(),
            line: idx + 1,
            value: id.to_string(),
        })?;
        records.push(Record {
            host: host.to_string(),
            name: name.to_string(),
            msg_type,
        });
    }
    Ok(records)
}

/// Parse an integer in C literal notation: `0x` hex, leading-zero octal or
/// decimal, with an optional leading `+`.
#[must_use]
pub fn parse_type(text: &str) -> Option<u32> {
    let digits = text.strip_prefix('+').unwrap_or(text);
    let (radix, body) = if let Some(hex) = digits
        .strip_prefix("0x")
        .or_else(|| digits.strip_prefix("0X"))
    {
        (16, hex)
    } else if digits.len() > 1 && digits.starts_with('0') {
        (8, &digits[1..])
    } else {
        (10, digits)
    };
    if body.is_empty() || !body.chars().all(|c| c.is_digit(radix)) {
        return None;
    }
    u32::from_str_radix(body, radix).ok()
}

fn is_executable(path: &Path) -> bool {
    access(path, AccessFlags::X_OK).is_ok() && fs::metadata(path).is_ok_and(|m| m.is_file())
}

fn lookup_user(op: &str, user: &str) -> Result<RunAs, RegistryError> {
    let unknown = || RegistryError::UnknownUser {
        name: op.to_string(),
        user: user.to_string(),
    };
    let entry = nix::unistd::User::from_name(user)
        .map_err(|_| unknown())?
        .ok_or_else(unknown)?;
    Ok(RunAs {
        user: user.to_string(),
        uid: entry.uid.as_raw(),
        gid: entry.gid.as_raw(),
    })
}
