//! Schema Catalog
//!
//! Process-wide cache of the current schema snapshot. Requests take a cheap
//! `Arc` clone of whatever snapshot is installed; reloads introspect without
//! holding any lock and then swap the pointer in one step.

use crate::error::PipelineError;
use crate::introspection::{SchemaSnapshot, SchemaSource};
use crate::snapshot::diff::{detect_drift, DriftChangeType, DriftReport};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

const DEFAULT_LOAD_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Clone)]
struct CachedSnapshot {
    snapshot: Arc<SchemaSnapshot>,
    loaded_at: Instant,
}

/// Result of an explicit reload
#[derive(Debug, Clone)]
pub struct ReloadOutcome {
    pub snapshot: Arc<SchemaSnapshot>,
    /// None on first load, or when a newer concurrent reload won
    pub drift: Option<DriftReport>,
}

pub struct SchemaCatalog {
    source: Arc<dyn SchemaSource>,
    ttl: Duration,
    load_timeout: Duration,
    current: RwLock<Option<CachedSnapshot>>,
    versions: AtomicU64,
}

impl SchemaCatalog {
    pub fn new(source: Arc<dyn SchemaSource>, ttl: Duration) -> Self {
        Self {
            source,
            ttl,
            load_timeout: DEFAULT_LOAD_TIMEOUT,
            current: RwLock::new(None),
            versions: AtomicU64::new(0),
        }
    }

    /// Deadline for one introspection, pool acquisition included
    pub fn with_load_timeout(mut self, timeout: Duration) -> Self {
        self.load_timeout = timeout;
        self
    }

    /// Current snapshot, introspecting first if none is cached or it expired
    pub async fn load(&self) -> Result<Arc<SchemaSnapshot>, PipelineError> {
        if let Some(cached) = self.cached() {
            if cached.loaded_at.elapsed() < self.ttl {
                return Ok(cached.snapshot);
            }
            debug!(version = cached.snapshot.version, "Schema snapshot expired");
        }
        Ok(self.reload().await?.snapshot)
    }

    /// Introspect now and install the result
    pub async fn reload(&self) -> Result<ReloadOutcome, PipelineError> {
        let started = Instant::now();
        let snapshot = tokio::time::timeout(self.load_timeout, self.source.introspect())
            .await
            .map_err(|_| {
                warn!(timeout_ms = self.load_timeout.as_millis() as u64, "Schema introspection deadline elapsed");
                PipelineError::SchemaUnavailable(format!(
                    "introspection timed out after {:?}",
                    self.load_timeout
                ))
            })??;

        if snapshot.tables.is_empty() {
            return Err(PipelineError::SchemaUnavailable(format!(
                "no tables found in schema '{}'",
                snapshot.namespace
            )));
        }

        Ok(self.install(snapshot, started))
    }

    /// Drop the cached snapshot; the next load introspects again
    pub fn invalidate(&self) {
        let mut slot = self.current.write().unwrap_or_else(PoisonError::into_inner);
        if slot.take().is_some() {
            info!("Schema catalog invalidated");
        }
    }

    /// Peek at the installed snapshot without loading
    pub fn current(&self) -> Option<Arc<SchemaSnapshot>> {
        self.cached().map(|c| c.snapshot)
    }

    fn cached(&self) -> Option<CachedSnapshot> {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn install(&self, mut snapshot: SchemaSnapshot, started: Instant) -> ReloadOutcome {
        let (installed, previous) = {
            let mut slot = self.current.write().unwrap_or_else(PoisonError::into_inner);

            if let Some(existing) = slot.as_ref() {
                if existing.loaded_at > started {
                    debug!(
                        version = existing.snapshot.version,
                        "Discarding reload result, a newer snapshot was installed meanwhile"
                    );
                    return ReloadOutcome {
                        snapshot: existing.snapshot.clone(),
                        drift: None,
                    };
                }
            }

            snapshot.version = self.versions.fetch_add(1, Ordering::SeqCst) + 1;
            let installed = Arc::new(snapshot);
            let previous = slot.replace(CachedSnapshot {
                snapshot: installed.clone(),
                loaded_at: Instant::now(),
            });
            (installed, previous)
        };

        let drift = previous.map(|p| detect_drift(&p.snapshot, &installed));

        match &drift {
            Some(report) if report.has_drift => {
                for change in &report.changes {
                    warn!(
                        object = %change.object_path,
                        change = ?change.change_type,
                        details = change.details.as_deref().unwrap_or(""),
                        "Schema drift detected"
                    );
                }
                let removed = report
                    .changes
                    .iter()
                    .filter(|c| c.change_type == DriftChangeType::Removed)
                    .count();
                info!(
                    version = installed.version,
                    changes = report.changes.len(),
                    removed,
                    "Schema snapshot replaced"
                );
            }
            Some(_) => debug!(version = installed.version, "Schema snapshot refreshed, no drift"),
            None => info!(
                version = installed.version,
                namespace = %installed.namespace,
                tables = installed.tables.len(),
                checksum = %installed.checksum,
                "Schema catalog loaded"
            ),
        }

        ReloadOutcome {
            snapshot: installed,
            drift,
        }
    }
}
