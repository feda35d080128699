//! The filesystem driver: applies a [`Group`] to a mounted cgroup
//! hierarchy and reads one back.
//!
//! All operations honor the version-specific semantics of the two
//! on-disk layouts: v1 groups get their `tasks` file chowned separately,
//! v2 groups need the controller enabled in every ancestor's
//! `cgroup.subtree_control` before the leaf may use it.

use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Read, Write};
use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::path::{Path, PathBuf};

use nix::unistd::{chown, Gid, Uid};

use crate::error::*;
use crate::group::{Controller, Group};
use crate::path::PathEnv;
use crate::{Context, Version, CG_VALUE_MAX};

/// Behavior switches for [`Context::delete_cgroup`].
#[derive(Debug, Clone, Copy, Default)]
pub struct DeleteFlags {
    /// Descend post-order and delete every subgroup first.
    pub recursive: bool,
    /// Keep going when moving tasks to the parent fails.
    pub ignore_migration: bool,
    /// Do not migrate tasks; fail with `NonEmpty` when the kernel
    /// refuses the removal.
    pub empty_only: bool,
}

/// `mkdir -p`. EEXIST is not an error; EPERM maps to `NotOwner`;
/// anything else maps to `NotAllowed` unless the path turns out to
/// exist after all.
pub(crate) fn mkdir_p(path: &Path) -> Result<()> {
    let mut current = PathBuf::new();
    for component in path.components() {
        current.push(component);
        if current.as_os_str().len() <= 1 {
            continue;
        }
        match fs::create_dir(&current) {
            Ok(()) => {}
            Err(err) => match err.kind() {
                std::io::ErrorKind::AlreadyExists => {}
                std::io::ErrorKind::PermissionDenied => {
                    return Err(Error::new(ErrorKind::NotOwner))
                }
                _ => {
                    if !current.exists() {
                        return Err(Error::new(ErrorKind::NotAllowed));
                    }
                }
            },
        }
    }
    Ok(())
}

/// Write a value into a control file, one `write` per newline-separated
/// chunk. Empty chunks are skipped with a warning.
pub(crate) fn set_control_value(path: &Path, value: &str) -> Result<()> {
    let mut file = match OpenOptions::new().read(true).write(true).open(path) {
        Ok(file) => file,
        Err(err) if err.kind() == std::io::ErrorKind::PermissionDenied => {
            // Disambiguate: a readable sibling tasks file means the
            // group is there and the kernel refused us; a missing one
            // means the controller is not mounted here.
            let tasks = path.parent().map(|p| p.join("tasks"));
            if let Some(tasks) = tasks {
                match File::open(&tasks) {
                    Ok(_) => return Err(Error::new(ErrorKind::NotAllowed)),
                    Err(terr) if terr.kind() == std::io::ErrorKind::NotFound => {
                        return Err(Error::new(ErrorKind::SubsysNotMounted))
                    }
                    Err(_) => return Err(Error::new(ErrorKind::NotAllowed)),
                }
            }
            return Err(Error::new(ErrorKind::ValueNotExist));
        }
        Err(_) => return Err(Error::new(ErrorKind::ValueNotExist)),
    };

    for chunk in value.split('\n') {
        if chunk.is_empty() {
            warn!("skipping empty line for {}", path.display());
            continue;
        }
        file.write_all(chunk.as_bytes()).map_err(Error::from_os)?;
    }

    Ok(())
}

/// Walk the settings of a controller and write each to disk under
/// `base`. A failure on a setting the caller never dirtied is ignored
/// when `ignore_non_dirty_failures` is set, so read-only values captured
/// by an earlier read do not block the operation.
pub(crate) fn set_values(
    base: &Path,
    controller: &mut Controller,
    ignore_non_dirty_failures: bool,
) -> Result<()> {
    for setting in controller.settings_mut() {
        let path = base.join(&setting.name);
        debug!("setting {} to {:?}", path.display(), setting.write_value());

        match set_control_value(&path, setting.write_value()) {
            Ok(()) => setting.dirty = false,
            Err(_) if ignore_non_dirty_failures && !setting.dirty => continue,
            Err(err) => return Err(err),
        }
    }
    Ok(())
}

/// Enable or disable a controller in the subtree_control file of `dir`.
pub(crate) fn subtree_control(dir: &Path, controller: &str, enable: bool) -> Result<()> {
    let value = if enable {
        format!("+{}", controller)
    } else {
        format!("-{}", controller)
    };
    set_control_value(&dir.join("cgroup.subtree_control"), &value)
}

/// Whether a controller is listed in the subtree_control file of `dir`.
pub(crate) fn get_subtree_control(dir: &Path, controller: &str) -> Result<bool> {
    let path = dir.join("cgroup.subtree_control");
    let content = fs::read_to_string(&path).map_err(Error::from_os)?;
    let first_line = content.lines().next().unwrap_or("");
    Ok(first_line.split(' ').any(|tok| tok == controller))
}

/// Enable a controller at the mount root and every level down to
/// `parent` inclusive, creating missing directories on the way. This is
/// what lets the eventual leaf use the controller.
fn subtree_control_recursive(env: &PathEnv, parent: &Path, controller: &str) -> Result<()> {
    let entry = env
        .mounts
        .lookup(controller)
        .ok_or_else(|| Error::new(ErrorKind::SubsysNotMounted))?;
    let root = entry.mounts[0].clone();

    let relative = parent
        .strip_prefix(&root)
        .map_err(|_| Error::new(ErrorKind::Fail))?
        .to_path_buf();

    let mut current = root;
    mkdir_p(&current)?;
    subtree_control(&current, controller, true)?;

    for component in relative.components() {
        current.push(component);
        mkdir_p(&current)?;
        subtree_control(&current, controller, true)?;
    }

    Ok(())
}

fn apply_owner(path: &Path, uid: Option<u32>, gid: Option<u32>) -> Result<()> {
    chown(path, uid.map(Uid::from_raw), gid.map(Gid::from_raw))?;
    Ok(())
}

fn apply_mode(path: &Path, mode: u32) -> Result<()> {
    fs::set_permissions(path, fs::Permissions::from_mode(mode)).map_err(Error::from_os)
}

/// Recursively chown a subtree. A `None` owner and group is a no-op.
fn chown_recursive(path: &Path, uid: Option<u32>, gid: Option<u32>) -> Result<()> {
    if uid.is_none() && gid.is_none() {
        return Ok(());
    }
    apply_owner(path, uid, gid)?;
    for entry in fs::read_dir(path).map_err(Error::from_os)? {
        let entry = entry.map_err(Error::from_os)?;
        let child = entry.path();
        if child.is_dir() {
            chown_recursive(&child, uid, gid)?;
        } else {
            apply_owner(&child, uid, gid)?;
        }
    }
    Ok(())
}

/// Recursively chmod a subtree: directories to `dir_mode`, regular
/// files to `file_mode`. The `tasks` file is owned by the tasks
/// permissions and is skipped here.
fn chmod_recursive(path: &Path, dir_mode: Option<u32>, file_mode: Option<u32>) -> Result<()> {
    if dir_mode.is_none() && file_mode.is_none() {
        return Ok(());
    }
    if let Some(mode) = dir_mode {
        apply_mode(path, mode)?;
    }
    for entry in fs::read_dir(path).map_err(Error::from_os)? {
        let entry = entry.map_err(Error::from_os)?;
        let child = entry.path();
        if child.is_dir() {
            chmod_recursive(&child, dir_mode, file_mode)?;
        } else if entry.file_name() != "tasks" {
            if let Some(mode) = file_mode {
                apply_mode(&child, mode)?;
            }
        }
    }
    Ok(())
}

/// Chown and chmod the v1 `tasks` file of a group directory.
pub(crate) fn chown_chmod_tasks(
    dir: &Path,
    uid: Option<u32>,
    gid: Option<u32>,
    fperm: Option<u32>,
) -> Result<()> {
    let tasks = dir.join("tasks");
    if uid.is_some() || gid.is_some() {
        apply_owner(&tasks, uid, gid)?;
    }
    if let Some(mode) = fperm {
        apply_mode(&tasks, mode)?;
    }
    Ok(())
}

/// Stream every pid out of `from` into the already-open target tasks
/// file, one write per pid. ESRCH means the process exited between the
/// read and the write and is not an error.
fn move_tasks(from: File, mut to: &File) -> Result<()> {
    for line in BufReader::new(from).lines() {
        let line = line.map_err(Error::from_os)?;
        let pid = line.trim();
        if pid.is_empty() {
            continue;
        }
        if let Err(err) = to.write_all(pid.as_bytes()) {
            if err.raw_os_error() == Some(libc::ESRCH) {
                continue;
            }
            return Err(Error::from_os(err));
        }
    }
    Ok(())
}

/// The parent group name, or `None` for the root group.
fn parent_group_name(name: &str) -> Option<String> {
    if name.is_empty() || name == "/" {
        return None;
    }
    match Path::new(name).parent() {
        None => None,
        Some(parent) if parent.as_os_str().is_empty() || parent == Path::new("/") => {
            Some(".".to_string())
        }
        Some(parent) => Some(parent.to_string_lossy().into_owned()),
    }
}

/// Collect the subdirectories of `dir` in post order (deepest first).
fn collect_subdirs_post_order(dir: &Path, out: &mut Vec<PathBuf>) -> Result<()> {
    for entry in fs::read_dir(dir).map_err(Error::from_os)? {
        let entry = entry.map_err(Error::from_os)?;
        let child = entry.path();
        if child.is_dir() {
            collect_subdirs_post_order(&child, out)?;
            out.push(child);
        }
    }
    Ok(())
}

fn write_pid(path: &Path, pid: libc::pid_t) -> Result<()> {
    let mut file = match OpenOptions::new().write(true).open(path) {
        Ok(file) => file,
        Err(err) => {
            warn!("cannot open {} for pid {}: {}", path.display(), pid, err);
            return Err(match err.kind() {
                std::io::ErrorKind::PermissionDenied => Error::new(ErrorKind::NotOwner),
                std::io::ErrorKind::NotFound => Error::new(ErrorKind::NotExist),
                _ => Error::new(ErrorKind::NotAllowed),
            });
        }
    };
    file.write_all(pid.to_string().as_bytes())
        .map_err(Error::from_os)
}

impl Context {
    /// Create the group on every hierarchy its controllers live on.
    ///
    /// The operation is not all-or-nothing: on failure the caller is
    /// expected to clean up with [`Context::delete_cgroup`]. The
    /// `CantSetValue` kind reports the in-between state where the
    /// directory was made but some values could not be written.
    pub fn create_cgroup(&self, group: &mut Group, ignore_ownership: bool) -> Result<()> {
        let env = self.path_env();

        for controller in group.controllers() {
            if env.mounts.lookup(&controller.name).is_none() {
                warn!("subsystem {} is not mounted", controller.name);
                return Err(Error::new(ErrorKind::SubsysNotMounted));
            }
        }

        if group.controllers().is_empty() {
            // A v2 group with no controllers enabled is valid.
            return self.create_one(&env, group, None, ignore_ownership);
        }

        let names: Vec<String> = group.controllers().iter().map(|c| c.name.clone()).collect();
        for name in names {
            self.create_one(&env, group, Some(&name), ignore_ownership)?;
        }
        Ok(())
    }

    fn create_one(
        &self,
        env: &PathEnv,
        group: &mut Group,
        controller: Option<&str>,
        ignore_ownership: bool,
    ) -> Result<()> {
        let dir = env
            .build(Some(&group.name), controller)
            .ok_or_else(|| Error::new(ErrorKind::Fail))?;
        let dir = PathBuf::from(dir);

        let version = match controller {
            Some(name) => env.mounts.controller_version(Some(name))?,
            None => Version::V2,
        };

        if let (Version::V2, Some(name)) = (version, controller) {
            if let Some(parent) = dir.parent() {
                subtree_control_recursive(env, parent, name)?;
            }
        }

        mkdir_p(&dir)?;

        if !ignore_ownership {
            debug!("changing ownership of {}", dir.display());
            chown_recursive(&dir, group.control_uid, group.control_gid)?;
            chmod_recursive(&dir, group.control_dperm, group.control_fperm)?;
        }

        if let Some(name) = controller {
            if version == Version::V2 {
                subtree_control(&dir, name, true)?;
            }

            let ctrl = group.get_controller_mut(name).unwrap();
            if let Err(err) = set_values(&dir, ctrl, true) {
                return Err(Error::with_cause(ErrorKind::CantSetValue, err));
            }
        }

        if !ignore_ownership && version == Version::V1 {
            chown_chmod_tasks(&dir, group.tasks_uid, group.tasks_gid, group.task_fperm)?;
        }

        Ok(())
    }

    /// Read the parent's settings, copy them into `group`, and create it.
    pub fn create_cgroup_from_parent(
        &self,
        group: &mut Group,
        ignore_ownership: bool,
    ) -> Result<()> {
        let parent_name = match parent_group_name(&group.name) {
            Some(name) if name != "." => name,
            Some(_) => String::from("/"),
            None => return Err(Error::new(ErrorKind::Fail)),
        };

        debug!("parent of {} is {}", group.name, parent_name);
        let mut parent = Group::new(&parent_name)?;
        self.get_cgroup(&mut parent)?;
        group.copy_from(&parent)?;
        self.create_cgroup(group, ignore_ownership)
    }

    /// Write every pending setting of the group to disk. Settings that
    /// were merely read back earlier (not dirty) do not fail the call.
    pub fn modify_cgroup(&self, group: &mut Group) -> Result<()> {
        let env = self.path_env();

        for controller in group.controllers() {
            if env.mounts.lookup(&controller.name).is_none() {
                warn!("subsystem {} is not mounted", controller.name);
                return Err(Error::new(ErrorKind::SubsysNotMounted));
            }
        }

        let name = group.name.clone();
        for controller in group.controllers_mut() {
            let dir = match env.build(Some(&name), Some(&controller.name)) {
                Some(dir) => PathBuf::from(dir),
                None => continue,
            };
            set_values(&dir, controller, true)?;
        }
        Ok(())
    }

    /// Populate the group's settings from disk.
    ///
    /// With no controllers on the group, every mounted controller that
    /// has the group directory is read; v2 controllers that are not
    /// enabled in subtree_control are silently dropped. With explicit
    /// controllers, only those are read and disabled ones are kept.
    pub fn get_cgroup(&self, group: &mut Group) -> Result<()> {
        let env = self.path_env();
        let requested: Vec<String> = group.controllers().iter().map(|c| c.name.clone()).collect();
        let mut reachable = 0usize;

        let entries: Vec<_> = env.mounts.entries().to_vec();
        for entry in &entries {
            if !requested.is_empty() && !requested.iter().any(|r| *r == entry.name) {
                continue;
            }

            let dir = match env.build(Some(&group.name), Some(&entry.name)) {
                Some(dir) => PathBuf::from(dir),
                None => continue,
            };
            if !dir.exists() {
                continue;
            }

            match entry.version {
                Version::V1 => {
                    let meta = fs::metadata(dir.join("tasks")).map_err(Error::from_os)?;
                    group.tasks_uid = Some(meta.uid());
                    group.tasks_gid = Some(meta.gid());
                }
                Version::V2 => {
                    // Root and non-root alike carry the file; treat a
                    // missing one as "nothing enabled".
                    let enabled = get_subtree_control(&dir, &entry.name).unwrap_or(false);
                    if !enabled && requested.is_empty() && !is_root_group(&group.name) {
                        reachable += 1;
                        continue;
                    }
                }
                _ => {}
            }

            if group.get_controller(&entry.name).is_none() {
                group.add_controller(&entry.name)?;
            }
            reachable += 1;

            let mut dir_entries: Vec<_> = fs::read_dir(&dir)
                .map_err(Error::from_os)?
                .filter_map(|e| e.ok())
                .collect();
            dir_entries.sort_by_key(|e| e.file_name());

            for file in dir_entries {
                let meta = match file.metadata() {
                    Ok(meta) => meta,
                    Err(_) => continue,
                };
                if !meta.is_file() {
                    continue;
                }
                let fname = file.file_name().to_string_lossy().into_owned();

                // The tasks file carries the tasks owner; every other
                // file reflects who may manage the group's shares.
                if fname != "tasks" {
                    group.control_uid = Some(meta.uid());
                    group.control_gid = Some(meta.gid());
                }

                let prefix = match fname.split('.').next() {
                    Some(prefix) => prefix,
                    None => continue,
                };
                if prefix != entry.name || fname == prefix {
                    continue;
                }

                let content = match read_control_file(&file.path()) {
                    Some(content) => content,
                    None => continue,
                };

                let ctrl = group.get_controller_mut(&entry.name).unwrap();
                install_read_value(ctrl, &fname, &content);
            }

            if entry.name == "memory" {
                if let Some(ctrl) = group.get_controller_mut("memory") {
                    ctrl.order_memory_limits();
                }
            }
        }

        if reachable == 0 {
            group.controllers_mut().clear();
            return Err(Error::new(ErrorKind::NotExist));
        }
        Ok(())
    }

    /// Remove the group from every hierarchy it lives on, migrating its
    /// tasks to the parent first. Keeps going after `NonEmpty` so
    /// partial clean-ups still make progress, and reports the first
    /// non-ignorable error.
    pub fn delete_cgroup(&self, group: &Group, flags: DeleteFlags) -> Result<()> {
        if flags.recursive && flags.empty_only {
            return Err(Error::new(ErrorKind::Invalid));
        }

        let env = self.path_env();
        for controller in group.controllers() {
            if env.mounts.lookup(&controller.name).is_none() {
                return Err(Error::new(ErrorKind::SubsysNotMounted));
            }
        }

        let controllers: Vec<Option<String>> = if group.controllers().is_empty() {
            vec![None]
        } else {
            group
                .controllers()
                .iter()
                .map(|c| Some(c.name.clone()))
                .collect()
        };

        let mut first_error: Option<Error> = None;
        let mut deleted_on_shared_mount = false;

        for controller in &controllers {
            let controller = controller.as_deref();
            let mut delete_root = true;
            let mut parent: Option<String> = None;

            if !flags.empty_only {
                match self.find_parent(&env, &group.name, controller) {
                    Ok(found) => {
                        if env
                            .mounts
                            .is_shared_mount(controller.unwrap_or(""))
                        {
                            deleted_on_shared_mount = true;
                        }
                        parent = found;
                    }
                    Err(err) => {
                        // A missing group on a shared v1 mount was
                        // already removed via a sibling controller.
                        let benign =
                            err.kind() == ErrorKind::NotExist && deleted_on_shared_mount;
                        if !benign {
                            record_error(&mut first_error, err);
                        }
                        continue;
                    }
                }

                if parent.is_none() {
                    // The root group itself.
                    if !flags.recursive {
                        continue;
                    }
                    parent = Some(".".to_string());
                    delete_root = false;
                }
            }

            let parent_tasks = match parent.as_deref() {
                Some(parent_name) => {
                    let path = match env.tasks_procs(Some(parent_name), controller) {
                        Ok(path) => path,
                        Err(err) => {
                            record_error(&mut first_error, err);
                            continue;
                        }
                    };
                    match OpenOptions::new().write(true).open(&path) {
                        Ok(file) => Some(file),
                        Err(err) => {
                            warn!("cannot open tasks file {}: {}", path, err);
                            record_error(&mut first_error, Error::from_os(err));
                            continue;
                        }
                    }
                }
                None => None,
            };

            let result = if flags.recursive {
                self.delete_recursive(
                    &env,
                    &group.name,
                    controller,
                    parent_tasks.as_ref(),
                    flags,
                    delete_root,
                )
            } else {
                self.delete_one(&env, &group.name, controller, parent_tasks.as_ref(), flags)
            };

            if let Err(err) = result {
                record_error(&mut first_error, err);
            }
        }

        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Resolve the immediate parent of the group under one controller,
    /// by comparing device numbers: a group sitting on a mount point has
    /// no parent.
    fn find_parent(
        &self,
        env: &PathEnv,
        name: &str,
        controller: Option<&str>,
    ) -> Result<Option<String>> {
        let child = env
            .build(Some(name), controller)
            .ok_or_else(|| Error::new(ErrorKind::Fail))?;
        let child = PathBuf::from(child);

        let child_meta = match fs::metadata(&child) {
            Ok(meta) => meta,
            Err(err) => {
                if env.mounts.is_shared_mount(controller.unwrap_or("")) {
                    return Err(Error::new(ErrorKind::NotExist));
                }
                return Err(Error::from_os(err));
            }
        };
        let parent_meta = fs::metadata(child.join("..")).map_err(Error::from_os)?;

        if child_meta.dev() != parent_meta.dev() {
            debug!("{} is a mount point, no parent", child.display());
            return Ok(None);
        }
        Ok(parent_group_name(name))
    }

    /// Remove one group from one controller, draining its tasks into
    /// the already-open parent file first. An already-removed group is a
    /// success.
    fn delete_one(
        &self,
        env: &PathEnv,
        name: &str,
        controller: Option<&str>,
        parent_tasks: Option<&File>,
        flags: DeleteFlags,
    ) -> Result<()> {
        debug!("removing group {:?}:{}", controller, name);

        if !flags.empty_only {
            let tasks_path = env
                .tasks_procs(Some(name), controller)
                .map_err(|_| Error::new(ErrorKind::SubsysNotMounted))?;

            match File::open(&tasks_path) {
                Ok(tasks) => {
                    if let Some(target) = parent_tasks {
                        if let Err(err) = move_tasks(tasks, target) {
                            warn!("removing tasks from {} failed: {}", tasks_path, err);
                            if !flags.ignore_migration {
                                return Err(err);
                            }
                        }
                    }
                }
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => {
                    error!("cannot open {}: {}", tasks_path, err);
                    if !flags.ignore_migration {
                        return Err(Error::from_os(err));
                    }
                }
            }
        }

        let dir = env
            .build(Some(name), controller)
            .ok_or_else(|| Error::new(ErrorKind::SubsysNotMounted))?;

        match fs::remove_dir(&dir) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => {
                if flags.empty_only && err.raw_os_error() == Some(libc::EBUSY) {
                    return Err(Error::new(ErrorKind::NonEmpty));
                }
                warn!("cannot remove directory {}: {}", dir, err);
                Err(Error::from_os(err))
            }
        }
    }

    fn delete_recursive(
        &self,
        env: &PathEnv,
        name: &str,
        controller: Option<&str>,
        parent_tasks: Option<&File>,
        flags: DeleteFlags,
        delete_root: bool,
    ) -> Result<()> {
        debug!("recursively removing {:?}:{}", controller, name);

        let base = env
            .build(Some(name), controller)
            .ok_or_else(|| Error::new(ErrorKind::SubsysNotMounted))?;
        let base = PathBuf::from(base);

        let mut subdirs = Vec::new();
        collect_subdirs_post_order(&base, &mut subdirs)?;

        for dir in subdirs {
            let relative = dir
                .strip_prefix(&base)
                .map_err(|_| Error::new(ErrorKind::Fail))?;
            let child_name = format!(
                "{}/{}",
                name.trim_end_matches('/'),
                relative.to_string_lossy()
            );
            self.delete_one(env, &child_name, controller, parent_tasks, flags)?;
        }

        if delete_root {
            self.delete_one(env, name, controller, parent_tasks, flags)?;
        }
        Ok(())
    }

    /// Attach a pid to the group, or to the root of every hierarchy
    /// when no group is given.
    pub fn attach_task(&self, group: Option<&Group>, pid: libc::pid_t) -> Result<()> {
        let env = self.path_env();

        let group = match group {
            None => {
                let entries: Vec<String> =
                    env.mounts.entries().iter().map(|e| e.name.clone()).collect();
                for name in entries {
                    let path = env.tasks_procs(None, Some(&name))?;
                    write_pid(Path::new(&path), pid)?;
                }
                return Ok(());
            }
            Some(group) => group,
        };

        for controller in group.controllers() {
            if env.mounts.lookup(&controller.name).is_none() {
                warn!("subsystem {} is not mounted", controller.name);
                return Err(Error::new(ErrorKind::SubsysNotMounted));
            }
        }

        let controllers: Vec<Option<String>> = if group.controllers().is_empty() {
            vec![None]
        } else {
            group
                .controllers()
                .iter()
                .map(|c| Some(c.name.clone()))
                .collect()
        };

        for controller in &controllers {
            let path = env.tasks_procs(Some(&group.name), controller.as_deref())?;
            write_pid(Path::new(&path), pid)?;
        }
        Ok(())
    }

    /// Attach a pid and every thread under `/proc/<pid>/task`.
    pub fn attach_task_threads(&self, group: Option<&Group>, pid: libc::pid_t) -> Result<()> {
        self.attach_task(group, pid)?;

        let process = procfs::process::Process::new(pid)?;
        for task in process.tasks()? {
            let task = task.map_err(Error::from)?;
            if task.tid == pid {
                continue;
            }
            self.attach_task(group, task.tid)?;
        }
        Ok(())
    }

    /// Every pid currently in the group under one controller, sorted
    /// and deduplicated.
    pub fn get_procs(&self, name: &str, controller: &str) -> Result<Vec<libc::pid_t>> {
        let env = self.path_env();
        let path = env.tasks_procs(Some(name), Some(controller))?;
        let file = File::open(&path).map_err(Error::from_os)?;

        let mut pids = Vec::new();
        for line in BufReader::new(file).lines() {
            let line = line.map_err(Error::from_os)?;
            if let Ok(pid) = line.trim().parse::<libc::pid_t>() {
                pids.push(pid);
            }
        }
        pids.sort_unstable();
        pids.dedup();
        Ok(pids)
    }
}

fn is_root_group(name: &str) -> bool {
    name.is_empty() || name == "/"
}

/// Remember the weakest error last: anything beats `NonEmpty`, and the
/// first error of any other kind wins.
fn record_error(slot: &mut Option<Error>, err: Error) {
    let replace = match slot {
        None => true,
        Some(existing) => {
            existing.kind() == ErrorKind::NonEmpty && err.kind() != ErrorKind::NonEmpty
        }
    };
    if replace {
        *slot = Some(err);
    }
}

/// Read up to [`CG_VALUE_MAX`] bytes of a control file and strip the
/// trailing newline. Unreadable files (write-only control knobs) are
/// skipped.
pub(crate) fn read_control_file(path: &Path) -> Option<String> {
    let file = File::open(path).ok()?;
    let mut content = String::new();
    file.take(CG_VALUE_MAX as u64)
        .read_to_string(&mut content)
        .ok()?;
    if content.ends_with('\n') {
        content.pop();
    }
    Some(content)
}

/// Install a value read back from disk: never dirty, with multi-line
/// content kept separately from the first-line primary value.
fn install_read_value(ctrl: &mut Controller, name: &str, content: &str) {
    let (value, multiline) = match content.find('\n') {
        Some(idx) => (content[..idx].to_string(), Some(content.to_string())),
        None => (content.to_string(), None),
    };

    if ctrl.get_setting(name).is_none() {
        let _ = ctrl.add_setting(name, "");
    }
    if let Some(setting) = ctrl.get_setting_mut(name) {
        setting.value = value;
        setting.multiline = multiline;
        setting.dirty = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mount::MountTable;

    fn write_file(path: &Path, content: &str) {
        let mut f = File::create(path).unwrap();
        f.write_all(content.as_bytes()).unwrap();
    }

    fn v1_context(root: &Path) -> Context {
        let mut table = MountTable::default();
        table.insert("cpu", root, Version::V1);
        Context::with_mounts(table)
    }

    #[test]
    fn mkdir_p_creates_nested_paths_and_tolerates_existing() {
        let dir = tempfile::tempdir().unwrap();
        let deep = dir.path().join("a/b/c");
        mkdir_p(&deep).unwrap();
        assert!(deep.is_dir());
        mkdir_p(&deep).unwrap();
    }

    #[test]
    fn set_control_value_splits_multiline_writes() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("io.max");
        write_file(&file, "");

        set_control_value(&file, "8:0 rbps=1024\n8:16 rbps=2048").unwrap();
        let content = fs::read_to_string(&file).unwrap();
        // One write per chunk; on a scratch file the chunks land
        // back-to-back.
        assert_eq!(content, "8:0 rbps=10248:16 rbps=2048");
    }

    #[test]
    fn missing_control_file_maps_to_value_not_exist() {
        let dir = tempfile::tempdir().unwrap();
        let err = set_control_value(&dir.path().join("cpu.nope"), "1").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ValueNotExist);
    }

    #[test]
    fn set_values_clears_dirty_and_honors_non_dirty_failures() {
        let dir = tempfile::tempdir().unwrap();
        write_file(&dir.path().join("cpu.shares"), "1024");

        let mut g = Group::new("g").unwrap();
        let cpu = g.add_controller("cpu").unwrap();
        cpu.add_setting("cpu.shares", "2048").unwrap();
        // A value read back earlier; its control file is absent here.
        let stale = cpu.add_setting("cpu.stat", "").unwrap();
        stale.dirty = false;

        let cpu = g.get_controller_mut("cpu").unwrap();
        set_values(dir.path(), cpu, true).unwrap();
        assert!(!cpu.get_setting("cpu.shares").unwrap().dirty);
        assert_eq!(fs::read_to_string(dir.path().join("cpu.shares")).unwrap(), "2048");
    }

    #[test]
    fn dirty_write_failure_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let mut g = Group::new("g").unwrap();
        let cpu = g.add_controller("cpu").unwrap();
        cpu.add_setting("cpu.shares", "2048").unwrap();

        let cpu = g.get_controller_mut("cpu").unwrap();
        assert!(set_values(dir.path(), cpu, true).is_err());
    }

    #[test]
    fn create_writes_settings_into_the_tree() {
        let root = tempfile::tempdir().unwrap();
        let ctx = v1_context(root.path());

        let mut g = Group::new("g1").unwrap();
        g.add_controller("cpu")
            .unwrap()
            .add_setting("cpu.shares", "2048")
            .unwrap();

        // The control file must exist before create writes it, as on a
        // real cgroupfs where the kernel materializes it.
        mkdir_p(&root.path().join("g1")).unwrap();
        write_file(&root.path().join("g1/cpu.shares"), "1024");
        write_file(&root.path().join("g1/tasks"), "");

        ctx.create_cgroup(&mut g, true).unwrap();
        assert_eq!(
            fs::read_to_string(root.path().join("g1/cpu.shares")).unwrap(),
            "2048"
        );
        assert!(!g
            .get_controller("cpu")
            .unwrap()
            .get_setting("cpu.shares")
            .unwrap()
            .dirty);
    }

    #[test]
    fn create_unmounted_controller_fails() {
        let root = tempfile::tempdir().unwrap();
        let ctx = v1_context(root.path());

        let mut g = Group::new("g1").unwrap();
        g.add_controller("blkio").unwrap();
        let err = ctx.create_cgroup(&mut g, true).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::SubsysNotMounted);
    }

    #[test]
    fn v2_create_enables_subtree_control_down_the_path() {
        let root = tempfile::tempdir().unwrap();
        let mut table = MountTable::default();
        table.insert("cpu", root.path(), Version::V2);
        table.set_v2_mount_path(root.path());
        let ctx = Context::with_mounts(table);

        // Stage the root subtree file; intermediate ones appear as the
        // driver creates the directories, so pre-create them too.
        write_file(&root.path().join("cgroup.subtree_control"), "");
        for sub in &["a", "a/b", "a/b/c"] {
            mkdir_p(&root.path().join(sub)).unwrap();
            write_file(&root.path().join(sub).join("cgroup.subtree_control"), "");
        }

        let mut g = Group::new("a/b/c").unwrap();
        g.add_controller("cpu").unwrap();
        ctx.create_cgroup(&mut g, true).unwrap();

        for level in &["cgroup.subtree_control", "a/cgroup.subtree_control", "a/b/cgroup.subtree_control"] {
            let content = fs::read_to_string(root.path().join(level)).unwrap();
            assert!(content.contains("+cpu"), "{}: {:?}", level, content);
        }
        // Legacy behavior: the new directory's own file is written too.
        let own = fs::read_to_string(root.path().join("a/b/c/cgroup.subtree_control")).unwrap();
        assert!(own.contains("+cpu"));
    }

    #[test]
    fn get_cgroup_reads_back_settings_clean() {
        let root = tempfile::tempdir().unwrap();
        let ctx = v1_context(root.path());

        let gdir = root.path().join("g1");
        mkdir_p(&gdir).unwrap();
        write_file(&gdir.join("cpu.shares"), "2048\n");
        write_file(&gdir.join("cpu.stat"), "usage 1\nuser 2\n");
        write_file(&gdir.join("tasks"), "");
        write_file(&gdir.join("notes.txt"), "ignored");

        let mut g = Group::new("g1").unwrap();
        ctx.get_cgroup(&mut g).unwrap();

        let cpu = g.get_controller("cpu").unwrap();
        let shares = cpu.get_setting("cpu.shares").unwrap();
        assert_eq!(shares.value, "2048");
        assert!(!shares.dirty);
        assert!(shares.multiline.is_none());

        let stat = cpu.get_setting("cpu.stat").unwrap();
        assert_eq!(stat.value, "usage 1");
        assert_eq!(stat.multiline.as_deref(), Some("usage 1\nuser 2"));
        assert!(cpu.get_setting("notes.txt").is_none());
        assert!(g.tasks_uid.is_some());
    }

    #[test]
    fn get_cgroup_missing_group_is_not_exist() {
        let root = tempfile::tempdir().unwrap();
        let ctx = v1_context(root.path());
        let mut g = Group::new("absent").unwrap();
        assert_eq!(
            ctx.get_cgroup(&mut g).unwrap_err().kind(),
            ErrorKind::NotExist
        );
    }

    #[test]
    fn delete_moves_tasks_to_parent_and_removes_dir() {
        let root = tempfile::tempdir().unwrap();
        let ctx = v1_context(root.path());

        let gdir = root.path().join("g1");
        mkdir_p(&gdir).unwrap();
        write_file(&root.path().join("tasks"), "");
        write_file(&gdir.join("tasks"), "101\n102\n");

        let mut g = Group::new("g1").unwrap();
        g.add_controller("cpu").unwrap();
        ctx.delete_cgroup(&g, DeleteFlags::default()).unwrap();

        assert!(!gdir.exists());
        let parent = fs::read_to_string(root.path().join("tasks")).unwrap();
        assert!(parent.contains("101") && parent.contains("102"));
    }

    #[test]
    fn delete_missing_group_is_success() {
        let root = tempfile::tempdir().unwrap();
        let ctx = v1_context(root.path());
        write_file(&root.path().join("tasks"), "");

        let mut g = Group::new("gone").unwrap();
        g.add_controller("cpu").unwrap();
        let flags = DeleteFlags {
            ignore_migration: true,
            ..DeleteFlags::default()
        };
        ctx.delete_cgroup(&g, flags).unwrap();
    }

    #[test]
    fn recursive_delete_removes_children_first() {
        let root = tempfile::tempdir().unwrap();
        let ctx = v1_context(root.path());

        write_file(&root.path().join("tasks"), "");
        for sub in &["g1", "g1/a", "g1/a/b"] {
            let dir = root.path().join(sub);
            mkdir_p(&dir).unwrap();
            write_file(&dir.join("tasks"), "");
        }

        let mut g = Group::new("g1").unwrap();
        g.add_controller("cpu").unwrap();
        let flags = DeleteFlags {
            recursive: true,
            ..DeleteFlags::default()
        };
        ctx.delete_cgroup(&g, flags).unwrap();
        assert!(!root.path().join("g1").exists());
    }

    #[test]
    fn empty_only_delete_reports_non_empty() {
        let root = tempfile::tempdir().unwrap();
        let ctx = v1_context(root.path());

        let gdir = root.path().join("g1");
        mkdir_p(&gdir.join("child")).unwrap();

        let mut g = Group::new("g1").unwrap();
        g.add_controller("cpu").unwrap();
        let flags = DeleteFlags {
            empty_only: true,
            ..DeleteFlags::default()
        };
        // Scratch filesystems report ENOTEMPTY where cgroupfs reports
        // EBUSY, so only the error-or-not outcome is portable here.
        assert!(ctx.delete_cgroup(&g, flags).is_err());
        assert!(gdir.exists());
    }

    #[test]
    fn attach_writes_pid_into_tasks() {
        let root = tempfile::tempdir().unwrap();
        let ctx = v1_context(root.path());

        let gdir = root.path().join("g1");
        mkdir_p(&gdir).unwrap();
        write_file(&gdir.join("tasks"), "");

        let mut g = Group::new("g1").unwrap();
        g.add_controller("cpu").unwrap();
        ctx.attach_task(Some(&g), 4321).unwrap();

        assert_eq!(fs::read_to_string(gdir.join("tasks")).unwrap(), "4321");
    }
}
