//! A Rust-native control plane for the Linux control-group (cgroup)
//! facility.
//!
//! The crate discovers how the kernel has exposed cgroup hierarchies to
//! userspace, creates/modifies/deletes groups and their control files,
//! translates settings between the cgroup v1 and v2 on-disk layouts, and
//! classifies running processes into groups according to
//! administrator-supplied rules. The `cgrulesengd` binary built from this
//! crate runs the classification daemon.
//!
//! Start with [`Context`]: it owns the process-wide state (mount table,
//! rule list, default slice, namespace table, template store) and exposes
//! the whole public API as methods.

#[macro_use]
extern crate log;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::RwLock;

pub mod abstraction;
pub mod builder;
pub mod classify;
pub mod daemon;
pub mod error;
pub mod events;
pub mod fs;
pub mod group;
pub mod mount;
pub mod path;
pub mod rules;

use crate::error::*;
use crate::rules::RuleList;

pub use crate::abstraction::Converted;
pub use crate::builder::GroupBuilder;
pub use crate::error::{Error, ErrorKind, Result};
pub use crate::fs::DeleteFlags;
pub use crate::group::{Controller, Group, Setting};
pub use crate::mount::{MountEntry, MountTable, SetupMode};
pub use crate::rules::{MatchOutcome, Rule};

/// Maximum number of controllers in the mount table and per group.
pub const CG_CONTROLLER_MAX: usize = 100;

/// Maximum number of settings per controller.
pub const CG_NV_MAX: usize = 100;

/// Maximum length of a control-file value.
pub const CG_VALUE_MAX: usize = 4096;

/// Maximum length of a controller name.
pub const MAX_NAME_LEN: usize = 32;

/// Maximum length of a group name or destination path.
pub const MAX_PATH_LEN: usize = 4096;

/// Maximum number of controllers in a single rule.
pub const MAX_MNT_ELEMENTS: usize = 16;

/// The name of the cgroup v2 pseudo-controller that owns the `cgroup.*`
/// control files.
pub const CGROUP_FILE_PREFIX: &str = "cgroup";

/// The on-disk layout a controller is mounted with.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum Version {
    /// Unknown; resolve against the mount table.
    Unknown,
    /// Whatever layout the controller is actually mounted with.
    Disk,
    /// Legacy cgroup v1 (one hierarchy per controller).
    V1,
    /// Unified cgroup v2 hierarchy.
    V2,
}

/// The library context.
///
/// Groups the process-wide structures behind reader-writer locks: the
/// mount table (replaced only by [`Context::reinit`]), the cached rule
/// list (replaced atomically on reload), the default-slice prefix, the
/// per-controller namespace table, and the template store used by the
/// classifier. The daemon holds exactly one `Context`; libraries may
/// share one across threads.
pub struct Context {
    pub(crate) mounts: RwLock<MountTable>,
    pub(crate) rules: RwLock<RuleList>,
    pub(crate) templates: RwLock<Vec<Group>>,
    pub(crate) default_slice: RwLock<Option<String>>,
    pub(crate) namespaces: RwLock<HashMap<String, String>>,
    pub(crate) rules_path: RwLock<(PathBuf, PathBuf)>,
}

/// Default path of the rules configuration file.
pub const DEFAULT_RULES_FILE: &str = "/etc/cgrules.conf";

/// Default path of the rules drop-in directory.
pub const DEFAULT_RULES_DIR: &str = "/etc/cgrules.d";

impl Context {
    /// Probe the kernel and build a context from the live mount table.
    ///
    /// Reads the kernel controller list and the mount list exactly once;
    /// call [`Context::reinit`] to pick up mount changes.
    pub fn new() -> Result<Context> {
        let table = MountTable::probe()?;
        Ok(Context::with_mounts(table))
    }

    /// Build a context around an explicit mount table.
    ///
    /// Used by configuration-defined mounts and by tests that stage a
    /// cgroup tree on a scratch filesystem.
    pub fn with_mounts(table: MountTable) -> Context {
        Context {
            mounts: RwLock::new(table),
            rules: RwLock::new(RuleList::default()),
            templates: RwLock::new(Vec::new()),
            default_slice: RwLock::new(None),
            namespaces: RwLock::new(HashMap::new()),
            rules_path: RwLock::new((
                PathBuf::from(DEFAULT_RULES_FILE),
                PathBuf::from(DEFAULT_RULES_DIR),
            )),
        }
    }

    /// Re-run the probe and atomically replace the mount table.
    pub fn reinit(&self) -> Result<()> {
        let table = MountTable::probe()?;
        *self.mounts.write().unwrap() = table;
        Ok(())
    }

    /// Set the process-wide default-slice prefix inserted between a mount
    /// point and the group name, unless the group name overrides it by
    /// starting with `/` followed by a non-empty segment.
    pub fn set_default_slice<S: Into<String>>(&self, slice: S) {
        let slice = slice.into();
        let mut guard = self.default_slice.write().unwrap();
        if slice.is_empty() {
            *guard = None;
        } else {
            *guard = Some(slice);
        }
    }

    /// Configure a namespace prefix for one controller.
    pub fn set_controller_namespace<S: Into<String>, P: Into<String>>(&self, controller: S, prefix: P) {
        self.namespaces
            .write()
            .unwrap()
            .insert(controller.into(), prefix.into());
    }

    /// Install the template database used by the classifier when a rule
    /// destination expands to a templated path.
    pub fn set_templates(&self, templates: Vec<Group>) {
        *self.templates.write().unwrap() = templates;
    }

    /// Point the rule store at a different configuration file and drop-in
    /// directory.
    pub fn set_rules_source<P: Into<PathBuf>, Q: Into<PathBuf>>(&self, file: P, dir: Q) {
        *self.rules_path.write().unwrap() = (file.into(), dir.into());
    }

    /// Whether the named controller appears in the mount table.
    pub fn subsys_mounted(&self, controller: &str) -> bool {
        self.mounts.read().unwrap().lookup(controller).is_some()
    }

    /// The mounted version of a controller. Passing `None` asks about the
    /// generic v2 hierarchy.
    pub fn controller_version(&self, controller: Option<&str>) -> Result<Version> {
        self.mounts.read().unwrap().controller_version(controller)
    }

    /// The current setup mode (legacy/unified/hybrid) as detected from
    /// the mount table.
    pub fn setup_mode(&self) -> SetupMode {
        self.mounts.read().unwrap().setup_mode()
    }

    /// All mount paths carrying the given version, including v2 mounts
    /// with no controllers enabled.
    pub fn list_mount_points(&self, version: Version) -> Result<Vec<PathBuf>> {
        self.mounts.read().unwrap().list_mount_points(version)
    }

    /// The canonical mount point of one controller.
    pub fn subsys_mount_point(&self, controller: &str) -> Result<PathBuf> {
        let mounts = self.mounts.read().unwrap();
        match mounts.lookup(controller) {
            Some(entry) => Ok(entry.mounts[0].clone()),
            None => Err(Error::new(ErrorKind::NotExist)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mount::MountTable;

    #[test]
    fn default_slice_round_trip() {
        let ctx = Context::with_mounts(MountTable::default());
        ctx.set_default_slice("database.slice");
        assert_eq!(
            ctx.default_slice.read().unwrap().as_deref(),
            Some("database.slice")
        );
        ctx.set_default_slice("");
        assert!(ctx.default_slice.read().unwrap().is_none());
    }

    #[test]
    fn unknown_controller_is_not_mounted() {
        let ctx = Context::with_mounts(MountTable::default());
        assert!(!ctx.subsys_mounted("cpu"));
        assert!(ctx.subsys_mount_point("cpu").is_err());
    }
}
