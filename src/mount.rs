//! Discovery of mounted cgroup hierarchies.
//!
//! The probe reads the kernel controller list (`/proc/cgroups`) and the
//! process mount list (`/proc/self/mounts`) and folds them into a
//! [`MountTable`]: one entry per controller, each carrying every path the
//! controller is reachable at. Version 1 controllers are recognized by
//! their mount options; version 2 controllers are read from the
//! `cgroup.controllers` file inside the unified mount.

use std::fs;
use std::path::{Path, PathBuf};

use nix::sys::statfs::{statfs, CGROUP2_SUPER_MAGIC, CGROUP_SUPER_MAGIC};

use crate::error::*;
use crate::{Version, CGROUP_FILE_PREFIX, CG_CONTROLLER_MAX, MAX_NAME_LEN};

/// A v1 named hierarchy the probe must not touch (it belongs to the init
/// system).
const OPAQUE_HIERARCHY: &str = "name=systemd";

/// How the kernel exposes cgroups on this host.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum SetupMode {
    Unknown,
    /// Only cgroup v1 hierarchies are mounted.
    Legacy,
    /// Only the unified cgroup v2 hierarchy is mounted.
    Unified,
    /// Both layouts are mounted at once.
    Hybrid,
}

/// One controller as exposed by the kernel.
#[derive(Debug, Clone)]
pub struct MountEntry {
    /// Canonical controller name. Named v1 hierarchies keep their
    /// `name=` prefix.
    pub name: String,
    /// Every path the controller is mounted at. The first entry is
    /// canonical; the rest are bind-mount aliases.
    pub mounts: Vec<PathBuf>,
    pub version: Version,
    /// Set when two or more controllers share a mount directory.
    pub shared: bool,
}

/// The process-wide table of mounted controllers.
#[derive(Debug, Clone, Default)]
pub struct MountTable {
    entries: Vec<MountEntry>,
    /// The most recently seen cgroup v2 mount point, with or without
    /// controllers enabled.
    v2_mount_path: Option<PathBuf>,
    /// v2 mounts whose `cgroup.controllers` was empty. They take part in
    /// setup-mode detection but not in controller lookup.
    empty_v2_mounts: Vec<PathBuf>,
}

/// One line of the process mount list.
#[derive(Debug, Clone)]
pub(crate) struct MountLine {
    pub dir: PathBuf,
    pub fstype: String,
    pub options: Vec<String>,
}

impl MountLine {
    fn parse(line: &str) -> Option<MountLine> {
        let mut fields = line.split_whitespace();
        let _device = fields.next()?;
        let dir = fields.next()?;
        let fstype = fields.next()?;
        let options = fields.next()?;
        Some(MountLine {
            dir: PathBuf::from(dir),
            fstype: fstype.to_string(),
            options: options.split(',').map(str::to_string).collect(),
        })
    }

    fn has_option(&self, opt: &str) -> bool {
        self.options.iter().any(|o| o == opt)
    }

    /// The value of a `key=value` option, if present.
    fn option_value(&self, key: &str) -> Option<&str> {
        let prefix_len = key.len() + 1;
        self.options
            .iter()
            .find(|o| o.starts_with(key) && o.as_bytes().get(key.len()) == Some(&b'='))
            .map(|o| &o[prefix_len..])
    }
}

/// Parse the kernel controller list: one line per controller after the
/// header, columns name/hierarchy/num-cgroups/enabled.
pub(crate) fn parse_proc_cgroups(text: &str) -> Vec<String> {
    let mut controllers = Vec::new();
    for line in text.lines().skip(1) {
        if let Some(name) = line.split_whitespace().next() {
            let mut name = name.to_string();
            name.truncate(MAX_NAME_LEN);
            controllers.push(name);
        }
    }
    controllers
}

impl MountTable {
    /// Probe the live system.
    pub fn probe() -> Result<MountTable> {
        let mounts_text = fs::read_to_string("/proc/self/mounts").map_err(Error::from_os)?;
        let mount_lines: Vec<MountLine> =
            mounts_text.lines().filter_map(MountLine::parse).collect();

        let controllers = match fs::read_to_string("/proc/cgroups") {
            Ok(text) => parse_proc_cgroups(&text),
            Err(err) => {
                // A pure-v2 kernel may hide /proc/cgroups behind
                // subset=pid; v2 discovery does not need it.
                let pure_v2 = mount_lines
                    .iter()
                    .any(|m| m.fstype == "proc" && m.has_option("subset=pid"));
                if !pure_v2 {
                    error!("cannot read /proc/cgroups: {}", err);
                    return Err(Error::new(ErrorKind::Invalid));
                }
                Vec::new()
            }
        };

        MountTable::build(&controllers, &mount_lines)
    }

    /// Fold mount lines into a table. Separated from [`MountTable::probe`]
    /// so configuration-defined mounts and tests can drive it directly.
    pub(crate) fn build(controllers: &[String], mount_lines: &[MountLine]) -> Result<MountTable> {
        let mut table = MountTable::default();
        let mut overflow = false;

        for line in mount_lines {
            match line.fstype.as_str() {
                "cgroup" => {
                    if controllers.is_empty() {
                        error!(
                            "cgroup v1 requires /proc/cgroups, \
                             check if /proc is mounted with subset=pid"
                        );
                        return Err(Error::new(ErrorKind::Invalid));
                    }
                    table.process_v1_mount(controllers, line)?;
                }
                "cgroup2" => table.process_v2_mount(line)?,
                _ => continue,
            }

            if table.entries.len() >= CG_CONTROLLER_MAX {
                overflow = true;
                break;
            }
        }

        if overflow {
            error!("mount points exceed the controller table capacity");
            return Err(Error::new(ErrorKind::MaxValuesExceeded));
        }

        if table.entries.is_empty() && table.empty_v2_mounts.is_empty() {
            return Err(Error::new(ErrorKind::NotMounted));
        }

        Ok(table)
    }

    /// Record one cgroup v1 mount: one entry per controller named in its
    /// options, plus an entry for a named hierarchy when `name=` appears.
    pub(crate) fn process_v1_mount(
        &mut self,
        controllers: &[String],
        line: &MountLine,
    ) -> Result<()> {
        for controller in controllers {
            if !line.has_option(controller) {
                continue;
            }
            debug!("found {} in {}", controller, line.dir.display());
            self.insert(controller, &line.dir, Version::V1);
            if self.entries.len() >= CG_CONTROLLER_MAX {
                return Ok(());
            }
        }

        if let Some(name) = line.option_value("name") {
            let named = format!("name={}", name);
            if named != OPAQUE_HIERARCHY {
                self.insert(&named, &line.dir, Version::V1);
            }
        }

        Ok(())
    }

    /// Record one cgroup v2 mount. Reads `cgroup.controllers` inside the
    /// mount; an empty file parks the mount on the empty-v2 list.
    pub(crate) fn process_v2_mount(&mut self, line: &MountLine) -> Result<()> {
        // Remembered even when no controllers are enabled; the path
        // builder uses it for controller-less v2 groups.
        self.v2_mount_path = Some(line.dir.clone());

        let controllers_path = line.dir.join("cgroup.controllers");
        let content = fs::read_to_string(&controllers_path).map_err(Error::from_os)?;
        let first_line = content.lines().next().unwrap_or("").trim();

        if first_line.is_empty() {
            if !self.empty_v2_mounts.contains(&line.dir) {
                self.empty_v2_mounts.push(line.dir.clone());
            }
            return Ok(());
        }

        // The "cgroup" pseudo-controller holds the cgroup.* files and is
        // manipulated like any other controller.
        for controller in first_line.split(' ').chain(Some(CGROUP_FILE_PREFIX)) {
            self.insert(controller, &line.dir, Version::V2);
            if self.entries.len() >= CG_CONTROLLER_MAX {
                return Ok(());
            }
        }

        Ok(())
    }

    /// Insert a controller mount. A repeated name only appends another
    /// mount path to the existing entry; a repeated directory marks the
    /// involved entries as sharing a mount.
    pub fn insert(&mut self, name: &str, dir: &Path, version: Version) {
        let mut shared = false;
        for entry in &mut self.entries {
            if entry.mounts[0] == dir && entry.name != name {
                entry.shared = true;
                shared = true;
            }
        }

        if let Some(entry) = self.entries.iter_mut().find(|e| e.name == name) {
            debug!(
                "controller {} is already mounted on {}",
                name,
                entry.mounts[0].display()
            );
            if !entry.mounts.iter().any(|m| m == dir) {
                entry.mounts.push(dir.to_path_buf());
            }
            return;
        }

        let mut name = name.to_string();
        name.truncate(MAX_NAME_LEN);
        self.entries.push(MountEntry {
            name,
            mounts: vec![dir.to_path_buf()],
            version,
            shared,
        });
    }

    /// Record the generic v2 mount path without inserting controllers.
    /// Tests and configuration-defined mounts use this to model a
    /// unified mount.
    pub fn set_v2_mount_path(&mut self, dir: &Path) {
        self.v2_mount_path = Some(dir.to_path_buf());
    }

    pub fn lookup(&self, name: &str) -> Option<&MountEntry> {
        self.entries.iter().find(|e| e.name == name)
    }

    pub fn entries(&self) -> &[MountEntry] {
        &self.entries
    }

    pub fn v2_mount_path(&self) -> Option<&Path> {
        self.v2_mount_path.as_deref()
    }

    pub fn empty_v2_mounts(&self) -> &[PathBuf] {
        &self.empty_v2_mounts
    }

    pub(crate) fn is_shared_mount(&self, controller: &str) -> bool {
        self.lookup(controller).map(|e| e.shared).unwrap_or(false)
    }

    /// The mounted version of a controller; `None` asks about the
    /// generic v2 hierarchy.
    pub fn controller_version(&self, controller: Option<&str>) -> Result<Version> {
        let name = match controller {
            None => {
                if self.v2_mount_path.is_some() {
                    return Ok(Version::V2);
                }
                return Err(Error::new(ErrorKind::Invalid));
            }
            Some(name) => name,
        };

        match self.lookup(name) {
            Some(entry) => Ok(entry.version),
            None => Err(Error::new(ErrorKind::NotExist)),
        }
    }

    /// Every mount path carrying the requested version, deduplicated.
    /// For v2 this includes mounts with no controllers enabled.
    pub fn list_mount_points(&self, version: Version) -> Result<Vec<PathBuf>> {
        if version != Version::V1 && version != Version::V2 {
            return Err(Error::new(ErrorKind::Invalid));
        }

        let mut paths: Vec<PathBuf> = Vec::new();
        for entry in self.entries.iter().filter(|e| e.version == version) {
            for mount in &entry.mounts {
                if !paths.contains(mount) {
                    paths.push(mount.clone());
                }
            }
        }

        if version == Version::V2 {
            for mount in &self.empty_v2_mounts {
                if !paths.contains(mount) {
                    paths.push(mount.clone());
                }
            }
        }

        Ok(paths)
    }

    /// Detect legacy/unified/hybrid from the filesystem magic of every
    /// canonical mount path.
    pub fn setup_mode(&self) -> SetupMode {
        let mut saw_v1 = false;
        let mut saw_v2 = !self.empty_v2_mounts.is_empty();

        for entry in &self.entries {
            let stat = match statfs(&entry.mounts[0]) {
                Ok(stat) => stat,
                Err(err) => {
                    error!("failed to stat {}: {}", entry.mounts[0].display(), err);
                    return SetupMode::Unknown;
                }
            };

            if stat.filesystem_type() == CGROUP2_SUPER_MAGIC {
                saw_v2 = true;
            } else if stat.filesystem_type() == CGROUP_SUPER_MAGIC {
                saw_v1 = true;
            }
        }

        match (saw_v1, saw_v2) {
            (true, true) => SetupMode::Hybrid,
            (false, true) => SetupMode::Unified,
            (true, false) => SetupMode::Legacy,
            (false, false) => SetupMode::Unknown,
        }
    }
}
