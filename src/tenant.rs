use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use chrono_tz::Tz;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::info;

use crate::compactor;
use crate::engine::Engine;
use crate::limits::*;
use crate::meeting::MeetingProvisioner;
use crate::notify::NotifyHub;
use crate::observability;

/// One engine per tenant, where a tenant is the database name a client
/// connects to. Each engine owns its WAL file and compactor task.
pub struct TenantManager {
    engines: DashMap<String, Arc<Engine>>,
    data_dir: PathBuf,
    compact_threshold: u64,
    default_tz: Tz,
    meetings: Arc<dyn MeetingProvisioner>,
}

/// Keep only characters that are safe in a file name.
fn wal_file_stem(tenant: &str) -> io::Result<String> {
    if tenant.len() > MAX_TENANT_NAME_LEN {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "tenant name too long",
        ));
    }
    let stem: String = tenant
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '_' || *c == '-')
        .collect();
    if stem.is_empty() {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "empty tenant name",
        ));
    }
    Ok(stem)
}

impl TenantManager {
    pub fn new(
        data_dir: PathBuf,
        compact_threshold: u64,
        default_tz: Tz,
        meetings: Arc<dyn MeetingProvisioner>,
    ) -> Self {
        Self {
            engines: DashMap::new(),
            data_dir,
            compact_threshold,
            default_tz,
            meetings,
        }
    }

    /// The tenant's engine, replaying its WAL on first use.
    pub fn get_or_create(&self, tenant: &str) -> io::Result<Arc<Engine>> {
        if let Some(engine) = self.engines.get(tenant) {
            return Ok(engine.value().clone());
        }
        let stem = wal_file_stem(tenant)?;
        if self.engines.len() >= MAX_TENANTS {
            return Err(io::Error::other("too many tenants"));
        }

        let engine = match self.engines.entry(tenant.to_string()) {
            Entry::Occupied(e) => return Ok(e.get().clone()),
            Entry::Vacant(slot) => {
                let wal_path = self.data_dir.join(format!("{stem}.wal"));
                let engine = Arc::new(Engine::new(
                    wal_path,
                    Arc::new(NotifyHub::new()),
                    self.meetings.clone(),
                    self.default_tz,
                )?);
                slot.insert(engine.clone());
                engine
            }
        };

        tokio::spawn(compactor::run_compactor(
            engine.clone(),
            self.compact_threshold,
        ));
        metrics::gauge!(observability::TENANTS_ACTIVE).set(self.engines.len() as f64);
        info!(tenant, "tenant loaded");
        Ok(engine)
    }
}
