//! Administrative task serializer
//!
//! Removals, renames, snapshot visibility and volume mode changes are
//! queued as tasks on a single-threaded queue per pool, so the tasks of one
//! pool run one at a time in submission order. Tasks of different pools may
//! run concurrently.
//!
//! A recursive operation is applied to the named dataset and everything
//! below it. Failures on individual volumes are logged and never fail the
//! operation as a whole.

use crate::manager::VolumeManager;
use crate::taskq::{TaskId, Taskq};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};
use txvol_common::{
    DatasetProp, Error, Result, SnapDev, VolMode, is_hidden, is_self_or_descendant, is_snapshot,
    pool_of, renamed,
};

/// One single-threaded queue per pool, started on first use
#[derive(Default)]
pub(crate) struct AdminQueues {
    queues: Mutex<HashMap<String, Arc<Taskq>>>,
}

impl AdminQueues {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    fn queue(&self, pool: &str) -> Result<Arc<Taskq>> {
        let mut queues = self.queues.lock();
        if let Some(queue) = queues.get(pool) {
            return Ok(Arc::clone(queue));
        }
        let queue = Arc::new(Taskq::new(&format!("txvol-admin-{pool}"), 1)?);
        queues.insert(pool.to_string(), Arc::clone(&queue));
        Ok(queue)
    }

    fn wait_all(&self) {
        let queues: Vec<Arc<Taskq>> = self.queues.lock().values().cloned().collect();
        for queue in queues {
            queue.wait_outstanding();
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
enum AdminOp {
    RemoveMinors,
    RenameMinors { new: String },
    SetSnapdev(SnapDev),
    SetVolmode(VolMode),
}

#[derive(Debug)]
struct AdminTask {
    pool: String,
    name: String,
    op: AdminOp,
}

impl AdminTask {
    /// `None` for hidden datasets, which are never acted on
    fn new(name: &str, op: AdminOp) -> Option<Self> {
        if is_hidden(name) {
            debug!(dataset = name, "ignoring task for hidden dataset");
            return None;
        }
        Some(Self {
            pool: pool_of(name).to_string(),
            name: name.to_string(),
            op,
        })
    }
}

/// Queued tasks a waiting caller blocks on
struct Dispatched(Vec<(Arc<Taskq>, TaskId)>);

impl Dispatched {
    fn wait(self) {
        for (queue, id) in self.0 {
            queue.wait_id(id);
        }
    }
}

impl VolumeManager {
    fn dispatch(self: &Arc<Self>, task: AdminTask, dispatched: &mut Dispatched) -> Result<()> {
        let queue = self.admin.queue(&task.pool)?;
        let manager = Arc::clone(self);
        let id = queue.dispatch(move || manager.run_task(&task));
        dispatched.0.push((queue, id));
        Ok(())
    }

    fn run_task(&self, task: &AdminTask) {
        debug!(pool = %task.pool, dataset = %task.name, op = ?task.op, "running admin task");
        match &task.op {
            AdminOp::RemoveMinors => self.remove_minors_impl(&task.name),
            AdminOp::RenameMinors { new } => self.rename_minors_impl(&task.name, new),
            AdminOp::SetSnapdev(snapdev) => self.set_snapdev_impl(&task.name, *snapdev),
            AdminOp::SetVolmode(volmode) => self.set_volmode_impl(&task.name, *volmode),
        }
    }

    /// Detach `name`, its descendants and its snapshots.
    ///
    /// Volumes that are open or suspended are left attached.
    ///
    /// # Errors
    /// Only when the pool's queue cannot be started.
    pub fn remove_minors(self: &Arc<Self>, name: &str, wait: bool) -> Result<()> {
        let mut dispatched = Dispatched(Vec::new());
        if let Some(task) = AdminTask::new(name, AdminOp::RemoveMinors) {
            self.dispatch(task, &mut dispatched)?;
        }
        if wait {
            dispatched.wait();
        }
        Ok(())
    }

    fn remove_minors_impl(&self, name: &str) {
        let mut doomed = Vec::new();
        {
            let mut reg = self.registry.write();
            for volume in reg.volumes() {
                let mut state = volume.lock_state();
                if !is_self_or_descendant(&state.name, name) {
                    continue;
                }
                if volume.is_in_use(&state) {
                    debug!(volume = %state.name, "in use, not removing");
                    continue;
                }
                if reg.unlink(&volume, &mut state) {
                    doomed.push((state.name.clone(), state.presentation.take()));
                }
            }
        }
        for (volume, presentation) in doomed {
            if let Some(presentation) = presentation {
                presentation.withdraw();
            }
            info!(volume = %volume, "removed volume");
        }
    }

    /// Detach a single volume right away
    ///
    /// # Errors
    /// `NotFound` if it is not attached, `Busy` if it is open or suspended.
    pub fn remove_minor(&self, name: &str) -> Result<()> {
        let volume = self.registry.get(name).ok_or_else(|| Error::not_found(name))?;
        let presentation = {
            let mut reg = self.registry.write();
            let mut state = volume.lock_state();
            if state.removed || state.name != name {
                return Err(Error::not_found(name));
            }
            if volume.is_in_use(&state) {
                return Err(Error::busy(name));
            }
            reg.unlink(&volume, &mut state);
            state.presentation.take()
        };
        if let Some(presentation) = presentation {
            presentation.withdraw();
        }
        info!(volume = name, "removed volume");
        Ok(())
    }

    fn remove_minor_quiet(&self, name: &str) {
        match self.remove_minor(name) {
            Ok(()) | Err(Error::NotFound(_)) => {}
            Err(e) => debug!(volume = name, error = %e, "not removed"),
        }
    }

    /// Rename `old`, its descendants and its snapshots to live under `new`
    ///
    /// # Errors
    /// `InvalidArgument` when `new` is in a different pool.
    pub fn rename_minors(self: &Arc<Self>, old: &str, new: &str, wait: bool) -> Result<()> {
        if pool_of(old) != pool_of(new) {
            return Err(Error::invalid_argument(format!(
                "cannot rename {old} to {new} across pools"
            )));
        }
        let mut dispatched = Dispatched(Vec::new());
        let op = AdminOp::RenameMinors {
            new: new.to_string(),
        };
        if let Some(task) = AdminTask::new(old, op) {
            self.dispatch(task, &mut dispatched)?;
        }
        if wait {
            dispatched.wait();
        }
        Ok(())
    }

    fn rename_minors_impl(&self, old: &str, new: &str) {
        let mut moved = Vec::new();
        {
            let mut reg = self.registry.write();
            for volume in reg.volumes() {
                let mut state = volume.lock_state();
                let Some(to) = renamed(&state.name, old, new) else {
                    continue;
                };
                let from = state.name.clone();
                reg.rename(&volume, &mut state, to.clone());
                moved.push((from, to, state.presentation.clone()));
            }
        }
        // Host re-registration may block; the registry is not held across it
        for (from, to, presentation) in moved {
            if let Some(presentation) = presentation {
                if let Err(e) = presentation.rename(&to) {
                    warn!(volume = %to, error = %e, "cannot rename presentation");
                }
            }
            info!(from = %from, to = %to, "renamed volume");
        }
    }

    /// Store `snapdev` on `dataset`, then attach or detach the snapshots
    /// of it and every descendant accordingly
    ///
    /// # Errors
    /// Failures storing the property.
    pub fn set_snapshot_visibility(
        self: &Arc<Self>,
        dataset: &str,
        snapdev: SnapDev,
        wait: bool,
    ) -> Result<()> {
        self.store
            .set_prop(dataset, DatasetProp::SnapDev, u64::from(snapdev))?;
        let mut dispatched = Dispatched(Vec::new());
        if let Some(task) = AdminTask::new(dataset, AdminOp::SetSnapdev(snapdev)) {
            self.dispatch(task, &mut dispatched)?;
        }
        if wait {
            dispatched.wait();
        }
        Ok(())
    }

    /// Descendants of `dataset` to visit from a queued task, hidden ones
    /// left out
    fn task_descendants(&self, dataset: &str) -> Vec<String> {
        match self.store.list_descendants(dataset) {
            Ok(names) => names.into_iter().filter(|n| !is_hidden(n)).collect(),
            Err(e) => {
                warn!(dataset, error = %e, "cannot list descendants");
                Vec::new()
            }
        }
    }

    fn set_snapdev_impl(&self, dataset: &str, requested: SnapDev) {
        debug!(dataset, snapdev = ?requested, "applying snapshot visibility");
        for name in self.task_descendants(dataset) {
            // Descendants with their own setting keep it
            let snapdev = self.snapdev(&name);
            let snapshots = match self.store.list_snapshots(&name) {
                Ok(snapshots) => snapshots,
                Err(e) => {
                    warn!(dataset = %name, error = %e, "cannot list snapshots");
                    continue;
                }
            };
            for snapshot in snapshots {
                match snapdev {
                    SnapDev::Visible if self.store.is_volume(&snapshot) => {
                        self.attach_logged(&snapshot);
                    }
                    SnapDev::Visible => {}
                    SnapDev::Hidden => self.remove_minor_quiet(&snapshot),
                }
            }
        }
    }

    /// Store `volmode` on `dataset`, then re-create the presentation of it
    /// and every descendant volume
    ///
    /// # Errors
    /// Failures storing the property.
    pub fn set_mode(self: &Arc<Self>, dataset: &str, volmode: VolMode, wait: bool) -> Result<()> {
        self.store
            .set_prop(dataset, DatasetProp::VolMode, u64::from(volmode))?;
        let mut dispatched = Dispatched(Vec::new());
        if let Some(task) = AdminTask::new(dataset, AdminOp::SetVolmode(volmode)) {
            self.dispatch(task, &mut dispatched)?;
        }
        if wait {
            dispatched.wait();
        }
        Ok(())
    }

    fn set_volmode_impl(&self, dataset: &str, requested: VolMode) {
        debug!(dataset, volmode = ?requested, "applying volume mode");
        for name in self.task_descendants(dataset) {
            if is_snapshot(&name) || !self.store.is_volume(&name) {
                continue;
            }
            let volmode = self
                .store
                .get_prop(&name, DatasetProp::VolMode)
                .map_or(VolMode::Default, VolMode::from);
            self.remove_minor_quiet(&name);
            if volmode.resolve(self.config.default_volmode) != VolMode::None {
                self.attach_logged(&name);
            }
        }
    }

    /// Block until every administrative task queued so far has finished
    pub fn wait_admin(&self) {
        self.admin.wait_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lifecycle::OpenFlags;
    use crate::memstore::MemPool;
    use crate::minor::{PresentationEvent, PresentationKind, RecordingFactory};
    use std::time::Duration;
    use txvol_common::VolumeConfig;

    fn setup(factory: RecordingFactory) -> (MemPool, Arc<VolumeManager>) {
        let pool = MemPool::new("p", 1 << 30);
        let manager = VolumeManager::new(
            VolumeConfig::default(),
            Arc::new(pool.clone()),
            Arc::new(factory),
        )
        .unwrap();
        (pool, manager)
    }

    fn attach(pool: &MemPool, manager: &VolumeManager, names: &[&str]) {
        for name in names {
            if let Some((dataset, snap)) = name.split_once('@') {
                pool.snapshot(dataset, snap).unwrap();
            } else {
                pool.create_volume(name, 1 << 20, 4096).unwrap();
            }
            manager.create_minor(name).unwrap();
        }
    }

    #[test]
    fn test_remove_minors_recursive_skips_in_use() {
        let factory = RecordingFactory::new();
        let (pool, manager) = setup(factory.clone());
        pool.create_filesystem("p/fs").unwrap();
        attach(&pool, &manager, &["p/fs/a", "p/fs/a@s", "p/fs/b", "p/fsx"]);
        manager.open("p/fs/b", OpenFlags::read_only()).unwrap();

        manager.remove_minors("p/fs", true).unwrap();
        assert_eq!(manager.names(), vec!["p/fs/b".to_string(), "p/fsx".to_string()]);
        assert_eq!(factory.visible(), vec!["p/fs/b".to_string(), "p/fsx".to_string()]);

        manager.close("p/fs/b", OpenFlags::read_only()).unwrap();
        manager.remove_minors("p/fs", false).unwrap();
        manager.wait_admin();
        assert_eq!(manager.names(), vec!["p/fsx".to_string()]);
    }

    #[test]
    fn test_remove_minor_single() {
        let (pool, manager) = setup(RecordingFactory::new());
        attach(&pool, &manager, &["p/v"]);
        assert!(matches!(manager.remove_minor("p/w"), Err(Error::NotFound(_))));

        let token = manager.suspend("p/v").unwrap();
        assert!(matches!(manager.remove_minor("p/v"), Err(Error::Busy(_))));
        manager.resume(token).unwrap();

        manager.remove_minor("p/v").unwrap();
        assert!(manager.registry().is_empty());
    }

    #[test]
    fn test_rename_minors_recursive() {
        let factory = RecordingFactory::new();
        let (pool, manager) = setup(factory.clone());
        attach(&pool, &manager, &["p/a", "p/a@snap", "p/ab"]);
        let volume = manager.volume("p/a").unwrap();

        manager.rename_minors("p/a", "p/z", true).unwrap();
        assert_eq!(
            manager.names(),
            vec!["p/ab".to_string(), "p/z".to_string(), "p/z@snap".to_string()]
        );
        assert_eq!(volume.name(), "p/z");
        assert!(Arc::ptr_eq(&manager.volume("p/z").unwrap(), &volume));
        assert!(manager.volume("p/a").is_none());
        assert!(factory.visible().contains(&"p/z@snap".to_string()));

        assert!(matches!(
            manager.rename_minors("p/z", "q/z", true),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_admin_tasks_run_serially_in_order() {
        let factory = RecordingFactory::new().with_rename_delay(Duration::from_millis(20));
        let (pool, manager) = setup(factory.clone());
        attach(&pool, &manager, &["p/a", "p/a@snap", "p/c"]);

        manager.rename_minors("p/a", "p/b", false).unwrap();
        manager.rename_minors("p/b@snap", "p/b@old", false).unwrap();
        manager.rename_minors("p/c", "p/d", false).unwrap();
        manager.wait_admin();

        assert_eq!(factory.max_concurrent_renames(), 1);
        let renames: Vec<(String, String)> = factory
            .events()
            .into_iter()
            .filter_map(|e| match e {
                PresentationEvent::Renamed { from, to } => Some((from, to)),
                _ => None,
            })
            .collect();
        let expected = [
            ("p/a@snap", "p/b@snap"),
            ("p/b@snap", "p/b@old"),
            ("p/c", "p/d"),
        ];
        // The first task renames p/a and its snapshot in registry order
        assert_eq!(renames.len(), 4);
        assert!(renames.contains(&("p/a".to_string(), "p/b".to_string())));
        for (from, to) in expected {
            assert!(renames.contains(&(from.to_string(), to.to_string())));
        }
        let position = |from: &str| renames.iter().position(|(f, _)| f == from).unwrap();
        assert!(position("p/a@snap") < position("p/b@snap"));
        assert!(position("p/b@snap") < position("p/c"));
        assert_eq!(
            manager.names(),
            vec!["p/b".to_string(), "p/b@old".to_string(), "p/d".to_string()]
        );
    }

    #[test]
    fn test_snapshot_visibility() {
        let (pool, manager) = setup(RecordingFactory::new());
        attach(&pool, &manager, &["p/v"]);
        pool.snapshot("p/v", "s1").unwrap();
        pool.snapshot("p/v", "s2").unwrap();

        manager.set_snapshot_visibility("p/v", SnapDev::Visible, true).unwrap();
        assert_eq!(
            manager.names(),
            vec!["p/v".to_string(), "p/v@s1".to_string(), "p/v@s2".to_string()]
        );

        manager.open("p/v@s1", OpenFlags::read_only()).unwrap();
        manager.set_snapshot_visibility("p/v", SnapDev::Hidden, true).unwrap();
        // The open snapshot stays
        assert_eq!(manager.names(), vec!["p/v".to_string(), "p/v@s1".to_string()]);
    }

    #[test]
    fn test_set_mode_recreates_presentation() {
        let factory = RecordingFactory::new();
        let (pool, manager) = setup(factory.clone());
        attach(&pool, &manager, &["p/v", "p/w"]);
        manager.open("p/w", OpenFlags::read_only()).unwrap();

        manager.set_mode("p", VolMode::Dev, true).unwrap();
        let events = factory.events();
        assert!(events.contains(&PresentationEvent::Withdrawn {
            name: "p/v".to_string()
        }));
        assert!(events.contains(&PresentationEvent::Published {
            name: "p/v".to_string(),
            kind: PresentationKind::CharacterDevice,
            size: 1 << 20,
        }));
        // Open volumes keep their presentation
        assert!(!events.contains(&PresentationEvent::Withdrawn {
            name: "p/w".to_string()
        }));
        assert_eq!(manager.volume("p/v").unwrap().lock_state().volmode(), VolMode::Dev);

        manager.set_mode("p/v", VolMode::None, true).unwrap();
        assert!(manager.volume("p/v").is_none());
        manager.set_mode("p/v", VolMode::Default, true).unwrap();
        assert_eq!(manager.volume("p/v").unwrap().lock_state().volmode(), VolMode::Geom);
    }

    #[test]
    fn test_registry_free_while_presentation_renames() {
        let factory = RecordingFactory::new().with_rename_delay(Duration::from_millis(400));
        let (pool, manager) = setup(factory);
        attach(&pool, &manager, &["p/a", "p/other"]);

        manager.rename_minors("p/a", "p/b", false).unwrap();
        std::thread::sleep(Duration::from_millis(100));
        let start = std::time::Instant::now();
        let names = manager.names();
        assert!(start.elapsed() < Duration::from_millis(200));
        assert_eq!(names, vec!["p/b".to_string(), "p/other".to_string()]);
        manager.wait_admin();
    }

    #[test]
    fn test_visibility_task_lists_descendants_when_run() {
        let factory = RecordingFactory::new().with_rename_delay(Duration::from_millis(300));
        let (pool, manager) = setup(factory);
        attach(&pool, &manager, &["p/c"]);

        // Keep the pool's queue busy while the dataset tree changes
        manager.rename_minors("p/c", "p/d", false).unwrap();
        manager.set_snapshot_visibility("p", SnapDev::Visible, false).unwrap();
        pool.create_volume("p/n", 1 << 20, 4096).unwrap();
        pool.snapshot("p/n", "s").unwrap();
        manager.wait_admin();

        assert!(manager.volume("p/n@s").is_some());
    }

    #[test]
    fn test_hidden_names_ignored() {
        let (pool, manager) = setup(RecordingFactory::new());
        attach(&pool, &manager, &["p/v"]);
        manager.remove_minors("p/$tmp", true).unwrap();
        manager.remove_minors("p/v%recv", true).unwrap();
        assert_eq!(manager.names(), vec!["p/v".to_string()]);
    }
}
