//! Core type definitions for txvol
//!
//! Dataset names, volume property values and the helpers the registry and
//! the administrative queue use to match names against each other.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Longest dataset name accepted, including any snapshot suffix
pub const MAX_NAME_LEN: usize = 255;

/// Separator between a dataset and a child dataset
pub const CHILD_SEPARATOR: char = '/';

/// Separator between a dataset and one of its snapshots
pub const SNAPSHOT_SEPARATOR: char = '@';

/// Name validation errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum NameError {
    #[error("dataset name is empty")]
    Empty,
    #[error("dataset name must be at most {MAX_NAME_LEN} characters")]
    TooLong,
    #[error("dataset name has an empty component")]
    EmptyComponent,
    #[error("dataset name has more than one snapshot separator")]
    MultipleSnapshots,
    #[error("dataset name contains invalid character: {0:?}")]
    InvalidChar(char),
}

/// Validate a dataset or snapshot name.
///
/// # Errors
/// Returns the first rule the name breaks.
pub fn validate_name(name: &str) -> Result<(), NameError> {
    if name.is_empty() {
        return Err(NameError::Empty);
    }
    if name.len() > MAX_NAME_LEN {
        return Err(NameError::TooLong);
    }
    if name.matches(SNAPSHOT_SEPARATOR).count() > 1 {
        return Err(NameError::MultipleSnapshots);
    }
    if let Some(c) = name
        .chars()
        .find(|c| c.is_control() || matches!(c, '\0' | '#' | '*'))
    {
        return Err(NameError::InvalidChar(c));
    }
    let (dataset, snapshot) = split_snapshot(name);
    if dataset.split(CHILD_SEPARATOR).any(str::is_empty) || snapshot == Some("") {
        return Err(NameError::EmptyComponent);
    }
    Ok(())
}

/// Pool that owns `name`: everything before the first `/` or `@`.
#[must_use]
pub fn pool_of(name: &str) -> &str {
    name.find([CHILD_SEPARATOR, SNAPSHOT_SEPARATOR])
        .map_or(name, |idx| &name[..idx])
}

/// Split `pool/vol@snap` into (`pool/vol`, `Some("snap")`)
#[must_use]
pub fn split_snapshot(name: &str) -> (&str, Option<&str>) {
    match name.split_once(SNAPSHOT_SEPARATOR) {
        Some((dataset, snap)) => (dataset, Some(snap)),
        None => (name, None),
    }
}

/// Whether `name` refers to a snapshot
#[must_use]
pub fn is_snapshot(name: &str) -> bool {
    name.contains(SNAPSHOT_SEPARATOR)
}

/// Hidden and temporary datasets are never exposed as volumes.
///
/// `$` marks internal datasets (`$ORIGIN`, `$MOS`) and `%` marks the
/// temporary clones created by an in-progress receive.
#[must_use]
pub fn is_hidden(name: &str) -> bool {
    name.starts_with('$')
        || name.contains('%')
        || name
            .split([CHILD_SEPARATOR, SNAPSHOT_SEPARATOR])
            .any(|c| c.starts_with('$'))
}

/// True for `parent` itself, its descendants and its snapshots.
#[must_use]
pub fn is_self_or_descendant(name: &str, parent: &str) -> bool {
    match name.strip_prefix(parent) {
        Some("") => true,
        Some(rest) => rest.starts_with(CHILD_SEPARATOR) || rest.starts_with(SNAPSHOT_SEPARATOR),
        None => false,
    }
}

/// New name of `name` when `old` is renamed to `new`.
///
/// Returns `None` when `name` is unaffected by the rename.
#[must_use]
pub fn renamed(name: &str, old: &str, new: &str) -> Option<String> {
    if is_self_or_descendant(name, old) {
        Some(format!("{new}{}", &name[old.len()..]))
    } else {
        None
    }
}

/// Hash used to bucket volumes in the registry
#[must_use]
pub fn name_hash(name: &str) -> u64 {
    xxhash_rust::xxh64::xxh64(name.as_bytes(), 0)
}

/// How an attached volume is presented to the host
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VolMode {
    /// Use the configured default
    #[default]
    Default,
    /// Block provider
    Geom,
    /// Character device
    Dev,
    /// Not exposed at all
    None,
}

impl VolMode {
    /// Replace [`VolMode::Default`] with the configured default
    #[must_use]
    pub const fn resolve(self, default: Self) -> Self {
        match self {
            Self::Default => match default {
                Self::Default => Self::Geom,
                other => other,
            },
            other => other,
        }
    }
}

impl From<u64> for VolMode {
    fn from(value: u64) -> Self {
        match value {
            1 => Self::Geom,
            2 => Self::Dev,
            3 => Self::None,
            _ => Self::Default,
        }
    }
}

impl From<VolMode> for u64 {
    fn from(mode: VolMode) -> Self {
        match mode {
            VolMode::Default => 0,
            VolMode::Geom => 1,
            VolMode::Dev => 2,
            VolMode::None => 3,
        }
    }
}

impl fmt::Display for VolMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Default => "default",
            Self::Geom => "geom",
            Self::Dev => "dev",
            Self::None => "none",
        };
        f.write_str(s)
    }
}

/// Whether snapshots of a volume are attached as their own devices
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SnapDev {
    #[default]
    Hidden,
    Visible,
}

impl From<u64> for SnapDev {
    fn from(value: u64) -> Self {
        if value == 1 { Self::Visible } else { Self::Hidden }
    }
}

impl From<SnapDev> for u64 {
    fn from(value: SnapDev) -> Self {
        match value {
            SnapDev::Hidden => 0,
            SnapDev::Visible => 1,
        }
    }
}

/// Dataset `sync` property
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncPolicy {
    /// Honour the caller's synchronous flag
    #[default]
    Standard,
    /// Every write is committed to the log before completing
    Always,
    /// Synchronous requests are treated as asynchronous
    Disabled,
}

/// Dataset `logbias` property
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogBias {
    #[default]
    Latency,
    Throughput,
}

/// Integer dataset properties the volume layer reads or writes
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DatasetProp {
    ReadOnly,
    SnapDev,
    VolMode,
}

impl fmt::Display for DatasetProp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::ReadOnly => "readonly",
            Self::SnapDev => "snapdev",
            Self::VolMode => "volmode",
        };
        f.write_str(s)
    }
}

/// Direction of a block transfer
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum IoDirection {
    Read,
    Write,
}
