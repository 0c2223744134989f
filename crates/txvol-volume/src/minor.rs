//! Host presentation of attached volumes
//!
//! A volume is shown to the host either as a block provider or as a
//! character device. The host-specific registration lives behind
//! [`Presentation`]; the volume layer only publishes, resizes, renames and
//! withdraws it.

use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use txvol_common::{Result, VolMode};

/// Kind of host device a volume is exposed as
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PresentationKind {
    BlockProvider,
    CharacterDevice,
}

impl PresentationKind {
    /// Presentation for a resolved volume mode; `None` for mode `none`
    #[must_use]
    pub const fn for_mode(mode: VolMode) -> Option<Self> {
        match mode {
            VolMode::Dev => Some(Self::CharacterDevice),
            VolMode::None => None,
            VolMode::Default | VolMode::Geom => Some(Self::BlockProvider),
        }
    }
}

/// Host device exposing one volume
pub trait Presentation: Send + Sync {
    fn kind(&self) -> PresentationKind;

    /// Make the device visible with `size` bytes
    ///
    /// # Errors
    /// Host registration failures.
    fn publish(&self, size: u64) -> Result<()>;

    /// Announce a new media size
    fn resize(&self, size: u64);

    /// Re-register the device under a new name
    ///
    /// # Errors
    /// Host registration failures.
    fn rename(&self, new_name: &str) -> Result<()>;

    /// Remove the device from the host
    fn withdraw(&self);
}

/// Creates presentations for newly attached volumes
pub trait PresentationFactory: Send + Sync {
    /// # Errors
    /// Host registration failures.
    fn create(&self, kind: PresentationKind, name: &str) -> Result<Box<dyn Presentation>>;
}

/// What happened to a recorded presentation
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PresentationEvent {
    Published { name: String, kind: PresentationKind, size: u64 },
    Resized { name: String, size: u64 },
    Renamed { from: String, to: String },
    Withdrawn { name: String },
}

#[derive(Default)]
struct Journal {
    events: Vec<PresentationEvent>,
    in_flight: usize,
    max_in_flight: usize,
}

/// Factory whose presentations only record what was done to them.
///
/// Used by tests and the bench in place of a host device layer. An
/// optional delay inside `rename` widens the window in which two
/// administrative operations could overlap.
#[derive(Clone, Default)]
pub struct RecordingFactory {
    journal: Arc<Mutex<Journal>>,
    rename_delay: Option<Duration>,
}

impl RecordingFactory {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sleep for `delay` inside every rename
    #[must_use]
    pub fn with_rename_delay(mut self, delay: Duration) -> Self {
        self.rename_delay = Some(delay);
        self
    }

    /// Every event so far, in order
    #[must_use]
    pub fn events(&self) -> Vec<PresentationEvent> {
        self.journal.lock().events.clone()
    }

    /// Most renames ever running at once
    #[must_use]
    pub fn max_concurrent_renames(&self) -> usize {
        self.journal.lock().max_in_flight
    }

    /// Names currently published and not withdrawn
    #[must_use]
    pub fn visible(&self) -> Vec<String> {
        let journal = self.journal.lock();
        let mut names: Vec<String> = Vec::new();
        for event in &journal.events {
            match event {
                PresentationEvent::Published { name, .. } => names.push(name.clone()),
                PresentationEvent::Withdrawn { name } => names.retain(|n| n != name),
                PresentationEvent::Renamed { from, to } => {
                    for n in &mut names {
                        if n == from {
                            n.clone_from(to);
                        }
                    }
                }
                PresentationEvent::Resized { .. } => {}
            }
        }
        names.sort();
        names
    }
}

impl PresentationFactory for RecordingFactory {
    fn create(&self, kind: PresentationKind, name: &str) -> Result<Box<dyn Presentation>> {
        Ok(Box::new(RecordedDevice {
            kind,
            name: Mutex::new(name.to_string()),
            journal: Arc::clone(&self.journal),
            rename_delay: self.rename_delay,
        }))
    }
}

struct RecordedDevice {
    kind: PresentationKind,
    name: Mutex<String>,
    journal: Arc<Mutex<Journal>>,
    rename_delay: Option<Duration>,
}

impl Presentation for RecordedDevice {
    fn kind(&self) -> PresentationKind {
        self.kind
    }

    fn publish(&self, size: u64) -> Result<()> {
        self.journal.lock().events.push(PresentationEvent::Published {
            name: self.name.lock().clone(),
            kind: self.kind,
            size,
        });
        Ok(())
    }

    fn resize(&self, size: u64) {
        self.journal.lock().events.push(PresentationEvent::Resized {
            name: self.name.lock().clone(),
            size,
        });
    }

    fn rename(&self, new_name: &str) -> Result<()> {
        {
            let mut journal = self.journal.lock();
            journal.in_flight += 1;
            journal.max_in_flight = journal.max_in_flight.max(journal.in_flight);
        }
        if let Some(delay) = self.rename_delay {
            std::thread::sleep(delay);
        }
        let from = std::mem::replace(&mut *self.name.lock(), new_name.to_string());
        let mut journal = self.journal.lock();
        journal.in_flight -= 1;
        journal.events.push(PresentationEvent::Renamed {
            from,
            to: new_name.to_string(),
        });
        Ok(())
    }

    fn withdraw(&self) {
        self.journal.lock().events.push(PresentationEvent::Withdrawn {
            name: self.name.lock().clone(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_for_mode() {
        assert_eq!(
            PresentationKind::for_mode(VolMode::Geom),
            Some(PresentationKind::BlockProvider)
        );
        assert_eq!(
            PresentationKind::for_mode(VolMode::Dev),
            Some(PresentationKind::CharacterDevice)
        );
        assert_eq!(PresentationKind::for_mode(VolMode::None), None);
    }

    #[test]
    fn test_recording_factory_tracks_visibility() {
        let factory = RecordingFactory::new();
        let a = factory.create(PresentationKind::BlockProvider, "p/a").unwrap();
        let b = factory.create(PresentationKind::CharacterDevice, "p/b").unwrap();
        a.publish(1024).unwrap();
        b.publish(2048).unwrap();
        a.rename("p/x").unwrap();
        b.withdraw();
        a.resize(4096);

        assert_eq!(factory.visible(), vec!["p/x".to_string()]);
        assert_eq!(factory.max_concurrent_renames(), 1);
        assert_eq!(
            factory.events().last(),
            Some(&PresentationEvent::Resized {
                name: "p/x".into(),
                size: 4096
            })
        );
    }
}
