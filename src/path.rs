//! Composes filesystem paths for (group, controller, setting) tuples.
//!
//! Built paths always end with `/` so that a setting leaf name can be
//! appended directly. The builder honors the per-controller namespace
//! prefix and the process-wide default-slice prefix; a group name that
//! starts with `/` followed by a non-empty segment overrides the slice.

use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;

use crate::error::*;
use crate::mount::MountTable;
use crate::{Context, Version, CGROUP_FILE_PREFIX};

/// Append `suffix` to `prefix` (which must end with `/`), stripping a
/// leading `/` from the suffix and guaranteeing a trailing `/`.
fn concat_path(prefix: &str, suffix: &str) -> String {
    let suffix = suffix.strip_prefix('/').unwrap_or(suffix);
    if suffix.is_empty() || suffix.ends_with('/') {
        format!("{}{}", prefix, suffix)
    } else {
        format!("{}{}/", prefix, suffix)
    }
}

/// Build the directory path for a group under one controller, as a
/// string ending in `/`. Returns `None` for an unknown controller.
pub(crate) fn build_path_str(
    mounts: &MountTable,
    namespaces: &HashMap<String, String>,
    default_slice: Option<&str>,
    group: Option<&str>,
    controller: Option<&str>,
) -> Option<String> {
    // The operator overrides the default slice by naming the group
    // absolutely.
    let overridden = matches!(group, Some(name) if name.starts_with('/') && name.len() > 1);
    let slice = if overridden { None } else { default_slice };

    let slice_part = match slice {
        Some(slice) => format!("{}/", slice),
        None => String::new(),
    };

    // With no controller at all, the generic v2 mount is the base; this
    // is how controller-less v2 groups are addressed.
    if controller.is_none() {
        let v2 = mounts.v2_mount_path()?;
        let base = format!("{}/{}", v2.display(), slice_part);
        return Some(match group {
            Some(name) => concat_path(&base, name),
            None => base,
        });
    }

    let wanted = controller.unwrap();
    for entry in mounts.entries() {
        let matches = entry.name == wanted
            || (wanted == CGROUP_FILE_PREFIX && entry.version == Version::V2);
        if !matches {
            continue;
        }

        let base = match namespaces.get(&entry.name) {
            Some(ns) => format!("{}/{}{}/", entry.mounts[0].display(), slice_part, ns),
            None => format!("{}/{}", entry.mounts[0].display(), slice_part),
        };

        return Some(match group {
            Some(name) => concat_path(&base, name),
            None => base,
        });
    }

    None
}

/// Read `cgroup.type` in a v2 group directory and name the file pids are
/// written to. The root group has no `cgroup.type` and uses
/// `cgroup.procs`.
fn attach_leaf_for_v2(dir: &str) -> Result<&'static str> {
    let type_path = format!("{}cgroup.type", dir);
    let content = match fs::read_to_string(&type_path) {
        Ok(content) => content,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok("cgroup.procs"),
        Err(err) => {
            warn!("failed to read {}: {}", type_path, err);
            return Err(Error::from_os(err));
        }
    };

    match content.trim_end() {
        "domain" | "domain threaded" => Ok("cgroup.procs"),
        "threaded" => Ok("cgroup.threads"),
        other => {
            warn!("invalid {}: {}", type_path, other);
            Err(Error::new(ErrorKind::Invalid))
        }
    }
}

/// Build the path of the file a pid must be written to in order to join
/// the group: `tasks` for v1, `cgroup.procs`/`cgroup.threads` for v2
/// depending on the group type.
pub(crate) fn build_tasks_procs_path_str(
    mounts: &MountTable,
    namespaces: &HashMap<String, String>,
    default_slice: Option<&str>,
    group: Option<&str>,
    controller: Option<&str>,
) -> Result<String> {
    let dir = build_path_str(mounts, namespaces, default_slice, group, controller)
        .ok_or_else(|| Error::new(ErrorKind::SubsysNotMounted))?;

    let version = mounts.controller_version(controller)?;
    let leaf = match version {
        Version::V1 => "tasks",
        Version::V2 => attach_leaf_for_v2(&dir)?,
        _ => return Err(Error::new(ErrorKind::Fail)),
    };

    debug!("group attach path: {}{}", dir, leaf);
    Ok(format!("{}{}", dir, leaf))
}

/// A snapshot of the state the path builder needs, taken under the
/// context locks and then used without holding them. Filesystem I/O in
/// the driver never runs with a lock held.
#[derive(Clone)]
pub(crate) struct PathEnv {
    pub mounts: MountTable,
    pub namespaces: HashMap<String, String>,
    pub default_slice: Option<String>,
}

impl PathEnv {
    pub fn build(&self, group: Option<&str>, controller: Option<&str>) -> Option<String> {
        build_path_str(
            &self.mounts,
            &self.namespaces,
            self.default_slice.as_deref(),
            group,
            controller,
        )
    }

    pub fn tasks_procs(&self, group: Option<&str>, controller: Option<&str>) -> Result<String> {
        build_tasks_procs_path_str(
            &self.mounts,
            &self.namespaces,
            self.default_slice.as_deref(),
            group,
            controller,
        )
    }
}

impl Context {
    pub(crate) fn path_env(&self) -> PathEnv {
        PathEnv {
            mounts: self.mounts.read().unwrap().clone(),
            namespaces: self.namespaces.read().unwrap().clone(),
            default_slice: self.default_slice.read().unwrap().clone(),
        }
    }

    /// The directory a (group, controller) pair lives at, or `None` when
    /// the controller is unknown. Passing no controller addresses the
    /// generic v2 hierarchy.
    pub fn build_path(&self, group: Option<&str>, controller: Option<&str>) -> Option<PathBuf> {
        let mounts = self.mounts.read().unwrap();
        let namespaces = self.namespaces.read().unwrap();
        let slice = self.default_slice.read().unwrap();
        build_path_str(&mounts, &namespaces, slice.as_deref(), group, controller)
            .map(PathBuf::from)
    }

    /// The file pids are written to in order to join the group.
    pub fn build_tasks_procs_path(
        &self,
        group: Option<&str>,
        controller: Option<&str>,
    ) -> Result<PathBuf> {
        let mounts = self.mounts.read().unwrap();
        let namespaces = self.namespaces.read().unwrap();
        let slice = self.default_slice.read().unwrap();
        build_tasks_procs_path_str(&mounts, &namespaces, slice.as_deref(), group, controller)
            .map(PathBuf::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;
    use std::io::Write;
    use std::path::Path;

    fn v1_table() -> MountTable {
        let mut table = MountTable::default();
        table.insert("cpu", Path::new("/sys/fs/cgroup/cpu"), Version::V1);
        table.insert("memory", Path::new("/sys/fs/cgroup/memory"), Version::V1);
        table
    }

    fn no_ns() -> HashMap<String, String> {
        HashMap::new()
    }

    #[test]
    fn plain_group_path() {
        let table = v1_table();
        assert_eq!(
            build_path_str(&table, &no_ns(), None, Some("tomcat"), Some("cpu")),
            Some("/sys/fs/cgroup/cpu/tomcat/".to_string())
        );
    }

    #[test]
    fn root_group_is_the_mount_point() {
        let table = v1_table();
        assert_eq!(
            build_path_str(&table, &no_ns(), None, Some("/"), Some("memory")),
            Some("/sys/fs/cgroup/memory/".to_string())
        );
        assert_eq!(
            build_path_str(&table, &no_ns(), None, None, Some("memory")),
            Some("/sys/fs/cgroup/memory/".to_string())
        );
    }

    #[test]
    fn unknown_controller_yields_none() {
        let table = v1_table();
        assert_eq!(
            build_path_str(&table, &no_ns(), None, Some("g"), Some("blkio")),
            None
        );
    }

    #[test]
    fn namespace_prefix_is_inserted() {
        let table = v1_table();
        let mut ns = HashMap::new();
        ns.insert("cpu".to_string(), "compute".to_string());
        assert_eq!(
            build_path_str(&table, &ns, None, Some("web"), Some("cpu")),
            Some("/sys/fs/cgroup/cpu/compute/web/".to_string())
        );
    }

    #[test]
    fn default_slice_applies_unless_overridden() {
        let table = v1_table();
        assert_eq!(
            build_path_str(&table, &no_ns(), Some("database.slice"), Some("pg"), Some("cpu")),
            Some("/sys/fs/cgroup/cpu/database.slice/pg/".to_string())
        );
        // An absolute group name bypasses the slice.
        assert_eq!(
            build_path_str(&table, &no_ns(), Some("database.slice"), Some("/pg"), Some("cpu")),
            Some("/sys/fs/cgroup/cpu/pg/".to_string())
        );
        // The bare root does not.
        assert_eq!(
            build_path_str(&table, &no_ns(), Some("database.slice"), Some("/"), Some("cpu")),
            Some("/sys/fs/cgroup/cpu/database.slice/".to_string())
        );
    }

    #[test]
    fn cgroup_pseudo_controller_matches_any_v2_entry() {
        let mut table = MountTable::default();
        table.insert("cpu", Path::new("/sys/fs/cgroup"), Version::V2);
        table.set_v2_mount_path(Path::new("/sys/fs/cgroup"));
        assert_eq!(
            build_path_str(&table, &no_ns(), None, Some("g"), Some("cgroup")),
            Some("/sys/fs/cgroup/g/".to_string())
        );
    }

    #[test]
    fn no_controller_uses_the_v2_mount() {
        let mut table = MountTable::default();
        table.set_v2_mount_path(Path::new("/unified"));
        assert_eq!(
            build_path_str(&table, &no_ns(), None, Some("empty"), None),
            Some("/unified/empty/".to_string())
        );
        let v1_only = v1_table();
        assert_eq!(build_path_str(&v1_only, &no_ns(), None, Some("g"), None), None);
    }

    #[test]
    fn v1_attach_file_is_tasks() {
        let table = v1_table();
        let path =
            build_tasks_procs_path_str(&table, &no_ns(), None, Some("g"), Some("cpu")).unwrap();
        assert_eq!(path, "/sys/fs/cgroup/cpu/g/tasks");
    }

    #[test]
    fn v2_attach_file_follows_cgroup_type() {
        let dir = tempfile::tempdir().unwrap();
        let group = dir.path().join("g");
        std::fs::create_dir(&group).unwrap();

        let mut table = MountTable::default();
        table.insert("cpu", dir.path(), Version::V2);
        table.set_v2_mount_path(dir.path());

        // Root group: no cgroup.type file.
        let root =
            build_tasks_procs_path_str(&table, &no_ns(), None, Some("/"), Some("cpu")).unwrap();
        assert!(root.ends_with("/cgroup.procs"));

        for (cg_type, leaf) in &[
            ("domain", "cgroup.procs"),
            ("domain threaded", "cgroup.procs"),
            ("threaded", "cgroup.threads"),
        ] {
            let mut f = File::create(group.join("cgroup.type")).unwrap();
            writeln!(f, "{}", cg_type).unwrap();
            let path =
                build_tasks_procs_path_str(&table, &no_ns(), None, Some("g"), Some("cpu"))
                    .unwrap();
            assert!(path.ends_with(leaf), "{} -> {}", cg_type, path);
        }

        let mut f = File::create(group.join("cgroup.type")).unwrap();
        writeln!(f, "domain invalid").unwrap();
        assert!(
            build_tasks_procs_path_str(&table, &no_ns(), None, Some("g"), Some("cpu")).is_err()
        );
    }
}
