//! Query surface: geometry, space attributes and sparse-file seeks

use crate::backend::{Objset, TO_END, VOLUME_OBJECT};
use crate::manager::VolumeManager;
use crate::rangelock::RangeMode;
use crate::volume::Volume;
use serde::Serialize;
use std::sync::Arc;
use txvol_common::{Error, Result};

/// Sector size reported to the host
pub const SECTOR_SIZE: u64 = 512;

/// What the host sees of a volume
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct VolumeGeometry {
    pub sector_size: u64,
    pub media_size: u64,
    pub stripe_size: u64,
    pub stripe_offset: u64,
    /// Discard requests are honoured
    pub can_delete: bool,
}

/// Space attributes, reported in sectors
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SpaceAttribute {
    BlocksAvail,
    BlocksUsed,
    PoolBlocksAvail,
    PoolBlocksUsed,
}

impl SpaceAttribute {
    /// Look up an attribute by its host name
    #[must_use]
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "blocksavail" => Some(Self::BlocksAvail),
            "blocksused" => Some(Self::BlocksUsed),
            "poolblocksavail" => Some(Self::PoolBlocksAvail),
            "poolblocksused" => Some(Self::PoolBlocksUsed),
            _ => None,
        }
    }
}

/// The backing dataset of an open volume
fn backing(volume: &Volume) -> Result<Arc<dyn Objset>> {
    let state = volume.lock_state();
    state
        .backing
        .as_ref()
        .map(|b| Arc::clone(&b.objset))
        .ok_or_else(|| Error::NoDevice(state.name.clone()))
}

impl VolumeManager {
    #[must_use]
    pub fn geometry(&self, volume: &Volume) -> VolumeGeometry {
        let state = volume.lock_state();
        VolumeGeometry {
            sector_size: SECTOR_SIZE,
            media_size: state.volsize,
            stripe_size: state.volblocksize,
            stripe_offset: 0,
            can_delete: self.config.unmap_enabled,
        }
    }

    /// Value of a space attribute in 512-byte sectors
    ///
    /// # Errors
    /// `NoDevice` if the volume is not open.
    pub fn attribute(&self, volume: &Volume, attribute: SpaceAttribute) -> Result<u64> {
        let _suspend = volume.suspend_lock().read();
        let objset = backing(volume)?;
        let bytes = match attribute {
            SpaceAttribute::BlocksAvail => objset.space().available,
            SpaceAttribute::BlocksUsed => objset.space().referenced,
            SpaceAttribute::PoolBlocksAvail => {
                let pool = objset.pool_space();
                pool.size.saturating_sub(pool.allocated)
            }
            SpaceAttribute::PoolBlocksUsed => objset.pool_space().allocated,
        };
        Ok(bytes / SECTOR_SIZE)
    }

    /// Offset of the first byte of data at or after `offset`
    ///
    /// # Errors
    /// `NoDevice` if the volume is not open or there is no data past `offset`.
    pub fn seek_data(&self, volume: &Volume, offset: u64) -> Result<u64> {
        Self::seek(volume, offset, false)
    }

    /// Offset of the first hole at or after `offset`; the end of the volume
    /// counts as a hole
    ///
    /// # Errors
    /// `NoDevice` if the volume is not open or `offset` is past the end.
    pub fn seek_hole(&self, volume: &Volume, offset: u64) -> Result<u64> {
        Self::seek(volume, offset, true)
    }

    fn seek(volume: &Volume, offset: u64, hole: bool) -> Result<u64> {
        let _suspend = volume.suspend_lock().read();
        let objset = backing(volume)?;
        let _range = volume.range_lock().enter(0, TO_END, RangeMode::Reader);
        objset.offset_next(VOLUME_OBJECT, hole, offset)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lifecycle::OpenFlags;
    use crate::memstore::MemPool;
    use crate::minor::RecordingFactory;
    use bytes::Bytes;
    use txvol_common::VolumeConfig;

    fn setup() -> (Arc<VolumeManager>, Arc<Volume>) {
        let pool = MemPool::new("p", 1 << 30);
        pool.create_volume("p/v", 1 << 20, 4096).unwrap();
        let manager = VolumeManager::new(
            VolumeConfig::default(),
            Arc::new(pool),
            Arc::new(RecordingFactory::new()),
        )
        .unwrap();
        manager.create_minor("p/v").unwrap();
        let volume = manager.volume("p/v").unwrap();
        (manager, volume)
    }

    #[test]
    fn test_geometry() {
        let (manager, volume) = setup();
        let geometry = manager.geometry(&volume);
        assert_eq!(
            geometry,
            VolumeGeometry {
                sector_size: 512,
                media_size: 1 << 20,
                stripe_size: 4096,
                stripe_offset: 0,
                can_delete: true,
            }
        );
    }

    #[test]
    fn test_space_attributes() {
        let (manager, volume) = setup();
        assert!(matches!(
            manager.attribute(&volume, SpaceAttribute::BlocksUsed),
            Err(Error::NoDevice(_))
        ));
        manager.open("p/v", OpenFlags::read_write()).unwrap();
        assert_eq!(manager.attribute(&volume, SpaceAttribute::BlocksUsed).unwrap(), 0);

        assert!(manager.write_direct(&volume, 0, &Bytes::from(vec![1u8; 8192]), false).is_ok());
        assert_eq!(manager.attribute(&volume, SpaceAttribute::BlocksUsed).unwrap(), 16);
        assert_eq!(manager.attribute(&volume, SpaceAttribute::PoolBlocksUsed).unwrap(), 16);
        assert_eq!(
            manager.attribute(&volume, SpaceAttribute::PoolBlocksAvail).unwrap(),
            ((1 << 30) - 8192) / 512
        );
        assert_eq!(SpaceAttribute::from_name("blocksavail"), Some(SpaceAttribute::BlocksAvail));
        assert_eq!(SpaceAttribute::from_name("bogus"), None);
    }

    #[test]
    fn test_seek_data_and_hole() {
        let (manager, volume) = setup();
        manager.open("p/v", OpenFlags::read_write()).unwrap();
        let data = Bytes::from(vec![1u8; 4096]);
        assert!(manager.write_direct(&volume, 8192, &data, false).is_ok());

        assert_eq!(manager.seek_data(&volume, 0).unwrap(), 8192);
        assert_eq!(manager.seek_hole(&volume, 8192).unwrap(), 12288);
        assert_eq!(manager.seek_hole(&volume, 100).unwrap(), 100);
        assert!(matches!(manager.seek_data(&volume, 12288), Err(Error::NoDevice(_))));
        assert!(matches!(manager.seek_hole(&volume, 1 << 20), Err(Error::NoDevice(_))));
    }
}
