//! Durable domain and project collections.
//!
//! Each collection wraps one [`Storage`] file plus an in-memory map keyed
//! by id; the domain collection keeps a secondary map keyed by hostname.
//! Mutations write through and flush before returning. An update is
//! delete-then-insert at the storage layer, so the storage id changes
//! while the record's own `id` field stays the external identity.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::codec::Value;
use crate::storage::{Storage, StorageError};

/// Milliseconds since the Unix epoch.
pub fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

#[derive(Debug, thiserror::Error)]
pub enum DbError {
    #[error("{0}")]
    Validation(String),

    #[error("{kind} {id} not found")]
    NotFound { kind: &'static str, id: String },

    #[error("hostname {0} is already registered")]
    DuplicateHostname(String),

    #[error("project {id} is {status}, stop it before deleting")]
    ProjectBusy { id: String, status: ProjectStatus },

    #[error("record {id} is malformed: bad field {field:?}")]
    MalformedRecord { id: String, field: &'static str },

    #[error(transparent)]
    Storage(#[from] StorageError),
}

pub type Result<T> = std::result::Result<T, DbError>;

/// A hostname mapped onto a project.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Domain {
    pub id: Uuid,
    pub hostname: String,
    pub project_id: Uuid,
    pub ssl_enabled: bool,
    pub created_at: i64,
    pub updated_at: i64,
}

/// Supervisor-facing lifecycle state of a project.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProjectStatus {
    Stopped,
    Starting,
    Running,
    Error,
}

impl ProjectStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ProjectStatus::Stopped => "stopped",
            ProjectStatus::Starting => "starting",
            ProjectStatus::Running => "running",
            ProjectStatus::Error => "error",
        }
    }

    fn from_str(s: &str) -> Option<Self> {
        match s {
            "stopped" => Some(ProjectStatus::Stopped),
            "starting" => Some(ProjectStatus::Starting),
            "running" => Some(ProjectStatus::Running),
            "error" => Some(ProjectStatus::Error),
            _ => None,
        }
    }
}

impl std::fmt::Display for ProjectStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An uploaded backend binary and the socket it is exposed on.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Project {
    pub id: Uuid,
    pub name: String,
    pub binary_path: PathBuf,
    pub socket_path: PathBuf,
    pub status: ProjectStatus,
    pub pid: Option<u32>,
    pub created_at: i64,
    pub updated_at: i64,
}

/// Hostname rules: 1–253 bytes of ASCII alphanumerics, `-` and `.`,
/// with no empty labels.
pub fn validate_hostname(hostname: &str) -> Result<()> {
    if hostname.is_empty() || hostname.len() > 253 {
        return Err(DbError::Validation(format!(
            "hostname must be 1-253 characters, got {}",
            hostname.len()
        )));
    }
    if !hostname
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '.')
    {
        return Err(DbError::Validation(format!(
            "hostname {hostname:?} contains invalid characters"
        )));
    }
    if hostname.split('.').any(str::is_empty) {
        return Err(DbError::Validation(format!(
            "hostname {hostname:?} has an empty label"
        )));
    }
    Ok(())
}

/// Project names: `[A-Za-z0-9][A-Za-z0-9_-]{0,62}`.
pub fn validate_project_name(name: &str) -> Result<()> {
    let mut chars = name.chars();
    let valid = match chars.next() {
        Some(first) if first.is_ascii_alphanumeric() => {
            name.len() <= 63 && chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
        }
        _ => false,
    };
    if valid {
        Ok(())
    } else {
        Err(DbError::Validation(format!("invalid project name {name:?}")))
    }
}

fn field<'a>(fields: &'a [(String, Value)], name: &str) -> Option<&'a Value> {
    fields.iter().find(|(k, _)| k == name).map(|(_, v)| v)
}

fn domain_to_value(domain: &Domain) -> Value {
    Value::Object(vec![
        ("id".to_string(), Value::Uuid(*domain.id.as_bytes())),
        ("hostname".to_string(), Value::String(domain.hostname.clone())),
        ("project_id".to_string(), Value::Uuid(*domain.project_id.as_bytes())),
        ("ssl_enabled".to_string(), Value::Bool(domain.ssl_enabled)),
        ("created_at".to_string(), Value::Date(domain.created_at)),
        ("updated_at".to_string(), Value::Date(domain.updated_at)),
    ])
}

fn domain_from_value(storage_id: &str, value: &Value) -> Result<Domain> {
    let malformed = |field: &'static str| DbError::MalformedRecord {
        id: storage_id.to_string(),
        field,
    };
    let Value::Object(fields) = value else {
        return Err(malformed("<root>"));
    };
    Ok(Domain {
        id: Uuid::from_bytes(
            field(fields, "id").and_then(Value::as_uuid).ok_or_else(|| malformed("id"))?,
        ),
        hostname: field(fields, "hostname")
            .and_then(Value::as_str)
            .ok_or_else(|| malformed("hostname"))?
            .to_string(),
        project_id: Uuid::from_bytes(
            field(fields, "project_id")
                .and_then(Value::as_uuid)
                .ok_or_else(|| malformed("project_id"))?,
        ),
        ssl_enabled: field(fields, "ssl_enabled")
            .and_then(Value::as_bool)
            .ok_or_else(|| malformed("ssl_enabled"))?,
        created_at: field(fields, "created_at")
            .and_then(Value::as_date)
            .ok_or_else(|| malformed("created_at"))?,
        updated_at: field(fields, "updated_at")
            .and_then(Value::as_date)
            .ok_or_else(|| malformed("updated_at"))?,
    })
}

fn project_to_value(project: &Project) -> Value {
    let pid = match project.pid {
        Some(pid) => Value::Uint(u64::from(pid)),
        None => Value::Null,
    };
    Value::Object(vec![
        ("id".to_string(), Value::Uuid(*project.id.as_bytes())),
        ("name".to_string(), Value::String(project.name.clone())),
        (
            "binary_path".to_string(),
            Value::String(project.binary_path.to_string_lossy().into_owned()),
        ),
        (
            "socket_path".to_string(),
            Value::String(project.socket_path.to_string_lossy().into_owned()),
        ),
        ("status".to_string(), Value::String(project.status.as_str().to_string())),
        ("pid".to_string(), pid),
        ("created_at".to_string(), Value::Date(project.created_at)),
        ("updated_at".to_string(), Value::Date(project.updated_at)),
    ])
}

fn project_from_value(storage_id: &str, value: &Value) -> Result<Project> {
    let malformed = |field: &'static str| DbError::MalformedRecord {
        id: storage_id.to_string(),
        field,
    };
    let Value::Object(fields) = value else {
        return Err(malformed("<root>"));
    };
    let status = field(fields, "status")
        .and_then(Value::as_str)
        .and_then(ProjectStatus::from_str)
        .ok_or_else(|| malformed("status"))?;
    let pid = match field(fields, "pid") {
        Some(Value::Null) | None => None,
        Some(value) => Some(
            value
                .as_i64()
                .and_then(|v| u32::try_from(v).ok())
                .ok_or_else(|| malformed("pid"))?,
        ),
    };
    Ok(Project {
        id: Uuid::from_bytes(
            field(fields, "id").and_then(Value::as_uuid).ok_or_else(|| malformed("id"))?,
        ),
        name: field(fields, "name")
            .and_then(Value::as_str)
            .ok_or_else(|| malformed("name"))?
            .to_string(),
        binary_path: PathBuf::from(
            field(fields, "binary_path")
                .and_then(Value::as_str)
                .ok_or_else(|| malformed("binary_path"))?,
        ),
        socket_path: PathBuf::from(
            field(fields, "socket_path")
                .and_then(Value::as_str)
                .ok_or_else(|| malformed("socket_path"))?,
        ),
        status,
        pid,
        created_at: field(fields, "created_at")
            .and_then(Value::as_date)
            .ok_or_else(|| malformed("created_at"))?,
        updated_at: field(fields, "updated_at")
            .and_then(Value::as_date)
            .ok_or_else(|| malformed("updated_at"))?,
    })
}

struct DomainSlot {
    domain: Domain,
    storage_id: String,
}

struct DomainInner {
    storage: Storage,
    by_id: HashMap<Uuid, DomainSlot>,
    by_hostname: HashMap<String, Uuid>,
}

/// Fields of a domain that `PUT /api/domains/:id` may change.
#[derive(Debug, Default, Deserialize)]
pub struct DomainUpdate {
    pub hostname: Option<String>,
    pub project_id: Option<Uuid>,
    pub ssl_enabled: Option<bool>,
}

/// The domain collection: single writer, hostname-indexed.
pub struct DomainStore {
    inner: Mutex<DomainInner>,
}

impl DomainStore {
    /// Opens (or creates) the collection and loads every live record.
    ///
    /// A record that fails its checksum or decodes to the wrong shape is
    /// logged loudly and skipped; the rest of the collection still loads.
    /// A file-level failure (bad magic, I/O) is fatal to the caller.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let storage = Storage::open(path)?;
        let mut by_id = HashMap::new();
        let mut by_hostname = HashMap::new();

        for storage_id in storage.ids() {
            let loaded = storage
                .read(&storage_id)
                .map_err(DbError::from)
                .and_then(|v| domain_from_value(&storage_id, &v));
            let domain = match loaded {
                Ok(domain) => domain,
                Err(DbError::Storage(StorageError::Corruption { id })) => {
                    tracing::error!(record = %id, "skipping corrupted domain record");
                    continue;
                }
                Err(DbError::MalformedRecord { id, field }) => {
                    tracing::error!(record = %id, field, "skipping malformed domain record");
                    continue;
                }
                Err(other) => return Err(other),
            };
            by_hostname.insert(domain.hostname.clone(), domain.id);
            by_id.insert(domain.id, DomainSlot { domain, storage_id });
        }

        tracing::info!(domains = by_id.len(), "domain collection loaded");
        Ok(Self {
            inner: Mutex::new(DomainInner { storage, by_id, by_hostname }),
        })
    }

    pub fn create(&self, hostname: String, project_id: Uuid, ssl_enabled: bool) -> Result<Domain> {
        validate_hostname(&hostname)?;
        let mut inner = self.inner.lock();
        if inner.by_hostname.contains_key(&hostname) {
            return Err(DbError::DuplicateHostname(hostname));
        }

        let now = now_ms();
        let domain = Domain {
            id: Uuid::new_v4(),
            hostname: hostname.clone(),
            project_id,
            ssl_enabled,
            created_at: now,
            updated_at: now,
        };

        let (storage_id, _, _) = inner.storage.write(&domain_to_value(&domain))?;
        inner.storage.flush()?;
        inner.by_hostname.insert(hostname, domain.id);
        inner.by_id.insert(domain.id, DomainSlot { domain: domain.clone(), storage_id });
        Ok(domain)
    }

    pub fn update(&self, id: Uuid, update: DomainUpdate) -> Result<Domain> {
        if let Some(hostname) = &update.hostname {
            validate_hostname(hostname)?;
        }
        let mut inner = self.inner.lock();

        let slot = inner
            .by_id
            .get(&id)
            .ok_or_else(|| DbError::NotFound { kind: "domain", id: id.to_string() })?;
        let old_hostname = slot.domain.hostname.clone();
        let old_storage_id = slot.storage_id.clone();

        let mut domain = slot.domain.clone();
        if let Some(hostname) = update.hostname {
            if hostname != old_hostname && inner.by_hostname.contains_key(&hostname) {
                return Err(DbError::DuplicateHostname(hostname));
            }
            domain.hostname = hostname;
        }
        if let Some(project_id) = update.project_id {
            domain.project_id = project_id;
        }
        if let Some(ssl_enabled) = update.ssl_enabled {
            domain.ssl_enabled = ssl_enabled;
        }
        domain.updated_at = now_ms();

        inner.storage.delete(&old_storage_id)?;
        let (storage_id, _, _) = inner.storage.write(&domain_to_value(&domain))?;
        inner.storage.flush()?;

        if domain.hostname != old_hostname {
            inner.by_hostname.remove(&old_hostname);
            inner.by_hostname.insert(domain.hostname.clone(), id);
        }
        inner.by_id.insert(id, DomainSlot { domain: domain.clone(), storage_id });
        Ok(domain)
    }

    pub fn delete(&self, id: Uuid) -> Result<()> {
        let mut inner = self.inner.lock();
        let slot = inner
            .by_id
            .remove(&id)
            .ok_or_else(|| DbError::NotFound { kind: "domain", id: id.to_string() })?;
        inner.by_hostname.remove(&slot.domain.hostname);
        inner.storage.delete(&slot.storage_id)?;
        inner.storage.flush()?;
        Ok(())
    }

    pub fn get(&self, id: Uuid) -> Option<Domain> {
        self.inner.lock().by_id.get(&id).map(|s| s.domain.clone())
    }

    pub fn get_by_hostname(&self, hostname: &str) -> Option<Domain> {
        let inner = self.inner.lock();
        let id = inner.by_hostname.get(hostname)?;
        inner.by_id.get(id).map(|s| s.domain.clone())
    }

    pub fn list(&self) -> Vec<Domain> {
        let mut domains: Vec<Domain> =
            self.inner.lock().by_id.values().map(|s| s.domain.clone()).collect();
        domains.sort_by(|a, b| a.hostname.cmp(&b.hostname));
        domains
    }

    /// Hostnames of all ssl-enabled domains.
    pub fn ssl_enabled_hostnames(&self) -> Vec<String> {
        self.inner
            .lock()
            .by_id
            .values()
            .filter(|s| s.domain.ssl_enabled)
            .map(|s| s.domain.hostname.clone())
            .collect()
    }

    pub fn flush(&self) -> Result<()> {
        self.inner.lock().storage.flush()?;
        Ok(())
    }
}

struct ProjectSlot {
    project: Project,
    storage_id: String,
}

struct ProjectInner {
    storage: Storage,
    by_id: HashMap<Uuid, ProjectSlot>,
}

/// The project collection. The supervisor is the only authority on
/// liveness, so every project loads as `stopped` with no pid.
pub struct ProjectStore {
    inner: Mutex<ProjectInner>,
}

impl ProjectStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let storage = Storage::open(path)?;
        let mut by_id = HashMap::new();

        for storage_id in storage.ids() {
            let loaded = storage
                .read(&storage_id)
                .map_err(DbError::from)
                .and_then(|v| project_from_value(&storage_id, &v));
            let project = match loaded {
                Ok(mut project) => {
                    project.status = ProjectStatus::Stopped;
                    project.pid = None;
                    project
                }
                Err(DbError::Storage(StorageError::Corruption { id })) => {
                    tracing::error!(record = %id, "skipping corrupted project record");
                    continue;
                }
                Err(DbError::MalformedRecord { id, field }) => {
                    tracing::error!(record = %id, field, "skipping malformed project record");
                    continue;
                }
                Err(other) => return Err(other),
            };
            by_id.insert(project.id, ProjectSlot { project, storage_id });
        }

        tracing::info!(projects = by_id.len(), "project collection loaded");
        Ok(Self {
            inner: Mutex::new(ProjectInner { storage, by_id }),
        })
    }

    pub fn create(&self, name: String, binary_path: PathBuf, socket_path: PathBuf) -> Result<Project> {
        self.create_with_id(Uuid::new_v4(), name, binary_path, socket_path)
    }

    /// Creates a project under a caller-chosen id; the id is minted before
    /// the record so the binary and socket paths can embed it.
    pub fn create_with_id(
        &self,
        id: Uuid,
        name: String,
        binary_path: PathBuf,
        socket_path: PathBuf,
    ) -> Result<Project> {
        validate_project_name(&name)?;
        let mut inner = self.inner.lock();

        let now = now_ms();
        let project = Project {
            id,
            name,
            binary_path,
            socket_path,
            status: ProjectStatus::Stopped,
            pid: None,
            created_at: now,
            updated_at: now,
        };

        let (storage_id, _, _) = inner.storage.write(&project_to_value(&project))?;
        inner.storage.flush()?;
        inner.by_id.insert(project.id, ProjectSlot { project: project.clone(), storage_id });
        Ok(project)
    }

    /// Writes a status transition through to disk.
    pub fn set_status(&self, id: Uuid, status: ProjectStatus, pid: Option<u32>) -> Result<Project> {
        let mut inner = self.inner.lock();
        let slot = inner
            .by_id
            .get(&id)
            .ok_or_else(|| DbError::NotFound { kind: "project", id: id.to_string() })?;
        let old_storage_id = slot.storage_id.clone();

        let mut project = slot.project.clone();
        project.status = status;
        project.pid = pid;
        project.updated_at = now_ms();

        inner.storage.delete(&old_storage_id)?;
        let (storage_id, _, _) = inner.storage.write(&project_to_value(&project))?;
        inner.storage.flush()?;
        inner.by_id.insert(id, ProjectSlot { project: project.clone(), storage_id });
        Ok(project)
    }

    /// Removes a project record. Only stopped projects may be deleted.
    pub fn delete(&self, id: Uuid) -> Result<Project> {
        let mut inner = self.inner.lock();
        let slot = inner
            .by_id
            .get(&id)
            .ok_or_else(|| DbError::NotFound { kind: "project", id: id.to_string() })?;
        if slot.project.status != ProjectStatus::Stopped {
            return Err(DbError::ProjectBusy {
                id: id.to_string(),
                status: slot.project.status,
            });
        }
        let slot = inner.by_id.remove(&id).expect("presence checked");
        inner.storage.delete(&slot.storage_id)?;
        inner.storage.flush()?;
        Ok(slot.project)
    }

    pub fn get(&self, id: Uuid) -> Option<Project> {
        self.inner.lock().by_id.get(&id).map(|s| s.project.clone())
    }

    pub fn list(&self) -> Vec<Project> {
        let mut projects: Vec<Project> =
            self.inner.lock().by_id.values().map(|s| s.project.clone()).collect();
        projects.sort_by(|a, b| a.name.cmp(&b.name));
        projects
    }

    pub fn flush(&self) -> Result<()> {
        self.inner.lock().storage.flush()?;
        Ok(())
    }
}
