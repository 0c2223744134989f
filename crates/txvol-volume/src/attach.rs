//! Attaching volumes
//!
//! Attaching reads a volume's geometry, replays its intent log and
//! registers it with a host presentation. The dataset is only owned for
//! the duration of the attach; it is owned again on first open.

use crate::backend::{Objset, PROPS_OBJECT, SIZE_KEY, VOLUME_OBJECT};
use crate::manager::VolumeManager;
use crate::minor::PresentationKind;
use crate::volume::{Volume, VolumeParams};
use crate::zil::ReplayVector;
use std::sync::Arc;
use tracing::{debug, info, warn};
use txvol_common::{
    DatasetProp, Error, Result, SnapDev, VolMode, is_hidden, is_snapshot, validate_name,
};

impl VolumeManager {
    /// Attach one volume or volume snapshot
    ///
    /// # Errors
    /// - `InvalidName` for a malformed name
    /// - `Exists` if it is already attached
    /// - `NotFound` if there is no such dataset
    /// - `InvalidArgument` if the dataset is not a volume
    pub fn create_minor(&self, name: &str) -> Result<()> {
        validate_name(name)?;
        if is_hidden(name) {
            debug!(volume = name, "skipping hidden dataset");
            return Ok(());
        }
        if self.registry.get(name).is_some() {
            return Err(Error::Exists(name.to_string()));
        }
        if !self.store.exists(name) {
            return Err(Error::not_found(name));
        }
        if !self.store.is_volume(name) {
            return Err(Error::invalid_argument(format!("{name} is not a volume")));
        }

        let objset = self.store.own(name, true)?;
        let params = self.read_params(name, objset.as_ref());
        self.store.disown(objset);
        let params = params?;

        let volsize = params.volsize;
        let volmode = params.volmode;
        let volume = Volume::new(params);
        self.registry.insert(Arc::clone(&volume))?;
        {
            let state = volume.lock_state();
            if let Some(presentation) = &state.presentation {
                if let Err(e) = presentation.publish(volsize) {
                    warn!(volume = name, error = %e, "cannot publish volume");
                }
            }
        }
        info!(volume = name, volsize, %volmode, "attached volume");
        Ok(())
    }

    /// Geometry, presentation and log replay of an owned dataset
    fn read_params(&self, name: &str, objset: &dyn Objset) -> Result<VolumeParams> {
        let volblocksize = objset.object_block_size(VOLUME_OBJECT)?;
        let volsize = objset.zap_lookup(PROPS_OBJECT, SIZE_KEY)?;
        let volmode = VolMode::from(self.store.get_prop(name, DatasetProp::VolMode)?)
            .resolve(self.config.default_volmode);
        let snapshot = objset.is_snapshot();
        let writeable = objset.pool_writeable();

        if writeable && !snapshot {
            if self.config.replay_disable {
                objset.destroy_log()?;
            } else {
                let dnode = objset.hold_object(VOLUME_OBJECT)?;
                let replayed = objset.replay_log(&ReplayVector::new(objset, &dnode, volsize));
                objset.release_object(dnode);
                if let Err(e) = replayed {
                    warn!(volume = name, error = %e, "intent log replay failed");
                }
            }
        }

        let presentation = if self.config.inhibit_dev {
            None
        } else {
            PresentationKind::for_mode(volmode)
                .map(|kind| self.presentations.create(kind, name).map(Arc::from))
                .transpose()?
        };

        Ok(VolumeParams {
            name: name.to_string(),
            volsize,
            volblocksize,
            read_only: snapshot || !writeable,
            volmode,
            presentation,
        })
    }

    /// Attach every volume at or below `name`.
    ///
    /// Snapshots are attached when their `snapdev` property is visible.
    /// Failures of individual volumes are logged and skipped.
    ///
    /// # Errors
    /// `NotFound` when `name` does not exist.
    pub fn create_minors_recursive(&self, name: &str) -> Result<()> {
        if is_snapshot(name) {
            if self.snapdev(name) == SnapDev::Visible {
                self.attach_logged(name);
            }
            return Ok(());
        }

        let mut volumes: Vec<String> = self
            .store
            .list_descendants(name)?
            .into_iter()
            .filter(|n| !is_hidden(n) && self.store.is_volume(n))
            .collect();
        volumes.sort();

        // Warm the volumes' metadata in parallel, then attach in order
        let workers = self.engine().workers();
        let prefetches: Vec<_> = volumes
            .iter()
            .map(|volume| {
                let store = Arc::clone(&self.store);
                let volume = volume.clone();
                workers.dispatch(move || {
                    if let Ok(objset) = store.own(&volume, true) {
                        objset.prefetch(VOLUME_OBJECT, 0, 0);
                        store.disown(objset);
                    }
                })
            })
            .collect();

        for (volume, id) in volumes.iter().zip(prefetches) {
            workers.wait_id(id);
            self.attach_logged(volume);
            if self.snapdev(volume) == SnapDev::Visible {
                match self.store.list_snapshots(volume) {
                    Ok(mut snapshots) => {
                        snapshots.sort();
                        for snapshot in snapshots {
                            self.attach_logged(&snapshot);
                        }
                    }
                    Err(e) => warn!(volume = %volume, error = %e, "cannot list snapshots"),
                }
            }
        }
        Ok(())
    }

    pub(crate) fn snapdev(&self, name: &str) -> SnapDev {
        self.store
            .get_prop(name, DatasetProp::SnapDev)
            .map_or(SnapDev::Hidden, SnapDev::from)
    }

    /// Attach, logging anything but an already attached volume
    pub(crate) fn attach_logged(&self, name: &str) {
        match self.create_minor(name) {
            Ok(()) | Err(Error::Exists(_)) => {}
            Err(e) => warn!(volume = name, error = %e, "cannot attach volume"),
        }
    }
}
