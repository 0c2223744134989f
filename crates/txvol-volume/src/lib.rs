#![allow(clippy::result_large_err)]
//! txvol Volume Layer
//!
//! Exposes datasets of a transactional object store as block devices. The
//! layer keeps a registry of attached volumes, admits block requests under a
//! per-volume concurrency cap, serializes overlapping byte ranges, runs each
//! write in a store transaction and records it in the dataset's intent log
//! so that synchronous writes survive a crash.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────┐
//! │  Block / char layer  │  (Presentation)
//! └──────────┬───────────┘
//!            │ submit / read_direct / write_direct
//! ┌──────────▼───────────┐
//! │    VolumeManager     │
//! │  - VolumeRegistry    │  registry → suspend → state
//! │  - Engine (taskqs)   │  admission, range locks
//! │  - AdminQueues       │  one serial queue per pool
//! └──────────┬───────────┘
//!            │ Objset / Transaction / IntentLog
//! ┌──────────▼───────────┐
//! │     ObjectStore      │  (MemPool in tests and the bench)
//! └──────────────────────┘
//! ```

pub mod backend;
pub mod lockorder;
pub mod memstore;
pub mod minor;
pub mod rangelock;
pub mod registry;
pub mod stats;
pub mod suspend;
pub mod taskq;
pub mod volume;
pub mod zil;

pub mod admin;
pub mod attach;
pub mod direct;
pub mod io;
pub mod lifecycle;
pub mod manager;
pub mod query;
pub mod size;

pub use backend::{IntentLog, ObjectStore, Objset, Transaction};
pub use io::{AdmissionState, IoCompletion, IoOutcome, IoRequest, SubmitContext};
pub use lifecycle::{OpenFlags, SuspendToken};
pub use manager::VolumeManager;
pub use memstore::MemPool;
pub use minor::{Presentation, PresentationFactory, PresentationKind, RecordingFactory};
pub use query::{SECTOR_SIZE, SpaceAttribute, VolumeGeometry};
pub use rangelock::{RangeLock, RangeMode};
pub use stats::{IoStats, IoStatsSnapshot, LatencyHistogram};
pub use volume::{Volume, VolumeState};
