//! Volume manager
//!
//! Entry point of the volume layer. Operations are split across modules by
//! concern, each adding an `impl VolumeManager` block:
//!
//! - [`lifecycle`](crate::lifecycle): open, close, suspend, resume
//! - [`io`](crate::io) and [`direct`](crate::direct): block requests
//! - [`attach`](crate::attach): create minors
//! - [`admin`](crate::admin): per-pool serialized administrative tasks
//! - [`size`](crate::size): resize and block size changes
//! - [`query`](crate::query): geometry, space attributes, seek

use crate::admin::AdminQueues;
use crate::backend::ObjectStore;
use crate::io::Engine;
use crate::minor::PresentationFactory;
use crate::registry::VolumeRegistry;
use crate::volume::Volume;
use std::sync::Arc;
use tracing::info;
use txvol_common::{Result, VolumeConfig};

/// Manages every attached volume of one object store
pub struct VolumeManager {
    pub(crate) config: VolumeConfig,
    pub(crate) store: Arc<dyn ObjectStore>,
    pub(crate) registry: VolumeRegistry,
    pub(crate) presentations: Arc<dyn PresentationFactory>,
    pub(crate) admin: AdminQueues,
    engine: Arc<Engine>,
}

impl VolumeManager {
    /// Create a volume manager and start its thread pools
    ///
    /// # Errors
    /// `InvalidArgument` for an unusable configuration, or a host error
    /// when the worker threads cannot be started.
    pub fn new(
        config: VolumeConfig,
        store: Arc<dyn ObjectStore>,
        presentations: Arc<dyn PresentationFactory>,
    ) -> Result<Arc<Self>> {
        config.validate()?;
        let engine = Engine::new(&config)?;
        info!(
            max_active = config.max_active_per_volume,
            workers = config.worker_threads,
            triage = config.triage_threads,
            "volume manager started"
        );
        Ok(Arc::new(Self {
            config,
            store,
            registry: VolumeRegistry::new(),
            presentations,
            admin: AdminQueues::new(),
            engine,
        }))
    }

    #[must_use]
    pub const fn config(&self) -> &VolumeConfig {
        &self.config
    }

    #[must_use]
    pub fn store(&self) -> &Arc<dyn ObjectStore> {
        &self.store
    }

    #[must_use]
    pub const fn registry(&self) -> &VolumeRegistry {
        &self.registry
    }

    /// An attached volume by name
    #[must_use]
    pub fn volume(&self, name: &str) -> Option<Arc<Volume>> {
        self.registry.get(name)
    }

    /// Names of all attached volumes, sorted
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        self.registry.names()
    }

    pub(crate) const fn engine(&self) -> &Arc<Engine> {
        &self.engine
    }
}

impl std::fmt::Debug for VolumeManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VolumeManager")
            .field("volumes", &self.registry.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memstore::MemPool;
    use crate::minor::RecordingFactory;
    use txvol_common::Error;

    #[test]
    fn test_rejects_invalid_config() {
        let config = VolumeConfig {
            worker_threads: 0,
            ..VolumeConfig::default()
        };
        let result = VolumeManager::new(
            config,
            Arc::new(MemPool::new("p", 1 << 20)),
            Arc::new(RecordingFactory::new()),
        );
        assert!(matches!(result, Err(Error::InvalidArgument(_))));
    }

    #[test]
    fn test_lookup_by_name() {
        let pool = MemPool::new("p", 1 << 30);
        pool.create_volume("p/b", 1 << 20, 4096).unwrap();
        pool.create_volume("p/a", 1 << 20, 4096).unwrap();
        let manager = VolumeManager::new(
            VolumeConfig::default(),
            Arc::new(pool),
            Arc::new(RecordingFactory::new()),
        )
        .unwrap();
        manager.create_minor("p/b").unwrap();
        manager.create_minor("p/a").unwrap();

        assert_eq!(manager.names(), vec!["p/a".to_string(), "p/b".to_string()]);
        assert!(manager.volume("p/a").is_some());
        assert!(manager.volume("p/c").is_none());
        assert_eq!(manager.registry().len(), 2);
    }
}
