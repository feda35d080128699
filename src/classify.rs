//! Moving processes into the group their identity maps to.
//!
//! The classifier takes a matched rule, expands the `%`-escapes in its
//! destination, materializes any missing path segments (from the
//! template database when one applies), and writes the pid (and its
//! threads) into the destination group on every controller the rule
//! names.

use nix::unistd::{Gid, Group as NixGroup, Uid, User};

use crate::error::*;
use crate::group::Group;
use crate::rules::{MatchOutcome, Rule};
use crate::{Context, MAX_PATH_LEN};

/// The kernel truncates comm names to this length (including the NUL).
const TASK_COMM_LEN: usize = 16;

/// Expand `%U/%u/%G/%g/%P/%p` in a rule destination. `\` escapes the
/// next character. Output is clamped to [`MAX_PATH_LEN`].
pub(crate) fn expand_destination(
    dest: &str,
    uid: u32,
    gid: u32,
    pid: libc::pid_t,
    procname: Option<&str>,
) -> String {
    let mut out = String::with_capacity(dest.len());
    let mut chars = dest.chars();

    while let Some(c) = chars.next() {
        if out.len() >= MAX_PATH_LEN {
            break;
        }
        match c {
            '%' => match chars.next() {
                Some('U') => out.push_str(&uid.to_string()),
                Some('u') => match User::from_uid(Uid::from_raw(uid)) {
                    Ok(Some(user)) => out.push_str(&user.name),
                    _ => out.push_str(&uid.to_string()),
                },
                Some('G') => out.push_str(&gid.to_string()),
                Some('g') => match NixGroup::from_gid(Gid::from_raw(gid)) {
                    Ok(Some(group)) => out.push_str(&group.name),
                    _ => out.push_str(&gid.to_string()),
                },
                Some('P') => out.push_str(&pid.to_string()),
                Some('p') => match procname {
                    Some(name) => out.push_str(name),
                    None => out.push_str(&pid.to_string()),
                },
                Some(other) => {
                    out.push('%');
                    out.push(other);
                }
                None => out.push('%'),
            },
            '\\' => {
                if let Some(escaped) = chars.next() {
                    out.push(escaped);
                }
            }
            c => out.push(c),
        }
    }

    out.truncate(MAX_PATH_LEN);
    out
}

fn basename(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

/// The comm name from `/proc/<pid>/status` is truncated to 15 bytes,
/// so names compare equal on that prefix.
fn comm_equal(status_name: &str, candidate: &str) -> bool {
    let n = TASK_COMM_LEN - 1;
    let a = status_name.as_bytes();
    let b = candidate.as_bytes();
    a.iter().take(n).eq(b.iter().take(n))
}

/// The effective uid and gid of a process, from its status file.
pub fn uid_gid_of_pid(pid: libc::pid_t) -> Result<(u32, u32)> {
    let status = procfs::process::Process::new(pid)?.status()?;
    Ok((status.euid as u32, status.egid as u32))
}

/// Resolve the name a process should be matched by.
///
/// The executable link is authoritative; interpreters get their script
/// path recovered from the command line (resolved against the process
/// cwd when relative); kernel threads fall back to the comm name.
pub fn procname_of_pid(pid: libc::pid_t) -> Result<String> {
    let process = procfs::process::Process::new(pid)?;
    let status_name = process.status()?.name;

    let exe = match process.exe() {
        Ok(exe) => exe.to_string_lossy().into_owned(),
        // Kernel threads have no exe link.
        Err(_) => return Ok(status_name),
    };

    if comm_equal(&status_name, basename(&exe)) {
        return Ok(exe);
    }

    // The comm differs from the binary: likely a script. Find the
    // argument whose basename matches the comm and make it absolute.
    if let Ok(cmdline) = process.cmdline() {
        for arg in cmdline {
            if arg.is_empty() || !comm_equal(&status_name, basename(&arg)) {
                continue;
            }
            if arg.starts_with('/') {
                return Ok(arg);
            }
            if let Ok(cwd) = process.cwd() {
                let joined = cwd.join(&arg);
                if let Ok(resolved) = joined.canonicalize() {
                    return Ok(resolved.to_string_lossy().into_owned());
                }
            }
        }
    }

    // Executed through a symlink: the exe link is the real name.
    Ok(exe)
}

impl Context {
    /// Whether the group `prefix` already exists under `controller`.
    pub fn exist_in_subsystem(&self, controller: &str, prefix: &str) -> bool {
        match self.build_path(Some(prefix), Some(controller)) {
            Some(path) => path.is_dir(),
            None => false,
        }
    }

    /// The cgroup path a pid currently lives at under one controller
    /// (or on the unified hierarchy when no controller is given).
    pub fn get_current_controller_path(
        &self,
        pid: libc::pid_t,
        controller: Option<&str>,
    ) -> Result<String> {
        let process = procfs::process::Process::new(pid)?;
        for cg in process.cgroups()? {
            match controller {
                None => {
                    if cg.controllers.is_empty() {
                        return Ok(cg.pathname);
                    }
                }
                Some(name) => {
                    if cg.controllers.iter().any(|c| c == name) {
                        return Ok(cg.pathname);
                    }
                }
            }
        }
        Err(Error::new(ErrorKind::NotExist))
    }

    /// Attach a pid and all of its threads to `dest` on the given
    /// controllers (`*` meaning every mounted controller).
    pub fn change_cgroup_path(
        &self,
        dest: &str,
        pid: libc::pid_t,
        controllers: &[String],
    ) -> Result<()> {
        debug!("moving pid {} to cgroup {:?}", pid, dest);

        let mut group = Group::new(dest)?;
        if controllers.first().map(String::as_str) == Some("*") {
            let names: Vec<String> = {
                let mounts = self.mounts.read().unwrap();
                mounts.entries().iter().map(|e| e.name.clone()).collect()
            };
            for name in names {
                group.add_controller(&name)?;
            }
        } else {
            for name in controllers {
                group.add_controller(name)?;
            }
        }

        self.attach_task_threads(Some(&group), pid)
    }

    /// Create every missing path segment of a templated destination.
    ///
    /// Walking the expanded destination and the rule's literal
    /// destination in lockstep, each prefix that does not yet exist
    /// under some rule controller is created: from the matching
    /// template when the prefix was substituted, as a plain group when
    /// it was not.
    pub fn create_template_group(&self, group_name: &str, rule: &Rule) -> Result<()> {
        let template_segments: Vec<&str> = rule
            .destination
            .trim_matches('/')
            .split('/')
            .filter(|s| !s.is_empty())
            .collect();
        let group_segments: Vec<&str> = group_name
            .trim_matches('/')
            .split('/')
            .filter(|s| !s.is_empty())
            .collect();

        let depth = template_segments.len().min(group_segments.len());
        for level in 1..=depth {
            let group_prefix = group_segments[..level].join("/");
            let template_prefix = template_segments[..level].join("/");

            let missing: Vec<String> = rule
                .controllers
                .iter()
                .filter(|c| !self.exist_in_subsystem(c, &group_prefix))
                .cloned()
                .collect();
            if missing.is_empty() {
                continue;
            }

            if group_prefix == template_prefix {
                // The shared prefix carries no substitution: a plain
                // empty group is enough.
                let mut group = Group::new(&group_prefix)?;
                for controller in &missing {
                    group.add_controller(controller)?;
                }
                self.create_cgroup(&mut group, false)?;
            } else {
                self.instantiate_template(&group_prefix, &template_prefix, &missing)?;
            }
            debug!(
                "group {} created from template {}",
                group_prefix, template_prefix
            );
        }

        Ok(())
    }

    /// Create `target` from the template named `template_name`.
    ///
    /// For each controller a template exists for, the template group is
    /// created under the target's name (the template's settings and
    /// ownership apply); controllers without a template get a bare
    /// group.
    fn instantiate_template(
        &self,
        target: &str,
        template_name: &str,
        controllers: &[String],
    ) -> Result<()> {
        let templates = self.templates.read().unwrap().clone();

        for controller in controllers {
            let template = templates
                .iter()
                .find(|t| t.name == template_name && t.get_controller(controller).is_some());

            match template {
                Some(template) => {
                    let mut instance = template.clone();
                    instance.name = target.to_string();
                    self.create_cgroup(&mut instance, false)?;
                }
                None => {
                    let mut bare = Group::new(target)?;
                    bare.add_controller(controller)?;
                    self.create_cgroup(&mut bare, false)?;
                }
            }
        }
        Ok(())
    }

    /// The full classification pipeline for one process identity:
    /// match, expand, materialize, attach. Ignore-rule matches
    /// short-circuit; no match is a success.
    pub fn classify(
        &self,
        uid: u32,
        gid: u32,
        procname: Option<&str>,
        pid: libc::pid_t,
        use_cache: bool,
    ) -> Result<()> {
        let outcome = if use_cache {
            if !self.rules_loaded() {
                warn!("no cached rules found, reloading from configuration");
                self.load_rules()?;
            }
            self.match_rule(uid, gid, pid, procname)
        } else {
            debug!("not using cached rules for pid {}", pid);
            self.match_rule_uncached(uid, gid, pid, procname)?
        };

        let rules = match outcome {
            MatchOutcome::NoMatch => {
                debug!("no rule matches pid {}, uid {}, gid {}", pid, uid, gid);
                return Ok(());
            }
            MatchOutcome::Ignore => {
                debug!("pid {} matches an ignore rule", pid);
                return Ok(());
            }
            MatchOutcome::Match(rules) => rules,
        };

        for rule in &rules {
            debug!("executing rule {} for pid {}", rule.username, pid);
            let dest = expand_destination(&rule.destination, uid, gid, pid, procname);

            if dest != rule.destination {
                // The destination was substituted, so it names a
                // template instance that may not exist yet.
                self.create_template_group(&dest, rule)?;
            }

            self.change_cgroup_path(&dest, pid, &rule.controllers)?;
        }

        Ok(())
    }

    /// Classify every running process against the cached rules.
    /// Individual failures (races with exiting processes, kernel
    /// threads) are logged and skipped.
    pub fn change_all_cgroups(&self) -> Result<()> {
        let processes = procfs::process::all_processes()?;
        for process in processes {
            let pid = process.pid;
            let (uid, gid) = match uid_gid_of_pid(pid) {
                Ok(ids) => ids,
                Err(_) => continue,
            };
            let procname = match procname_of_pid(pid) {
                Ok(name) => name,
                Err(_) => continue,
            };
            if let Err(err) = self.classify(uid, gid, Some(&procname), pid, true) {
                debug!("cannot classify pid {}: {}", pid, err);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::mkdir_p;
    use crate::mount::MountTable;
    use crate::rules::RuleId;
    use crate::Version;
    use std::fs;
    use std::path::Path;

    #[test]
    fn expands_numeric_escapes() {
        let out = expand_destination("users/%U/tasks-%P", 1000, 100, 4242, None);
        assert_eq!(out, "users/1000/tasks-4242");
    }

    #[test]
    fn procname_escape_falls_back_to_pid() {
        assert_eq!(expand_destination("g/%p", 0, 0, 7, None), "g/7");
        assert_eq!(expand_destination("g/%p", 0, 0, 7, Some("prog")), "g/prog");
    }

    #[test]
    fn unknown_escape_is_kept_verbatim() {
        assert_eq!(expand_destination("a%zb", 0, 0, 1, None), "a%zb");
    }

    #[test]
    fn backslash_escapes_one_character() {
        assert_eq!(expand_destination(r"a\%Ub", 5, 5, 1, None), "a%Ub");
    }

    #[test]
    fn username_escape_resolves_root() {
        // uid 0 exists on any Linux system this test runs on.
        assert_eq!(expand_destination("%u", 0, 0, 1, None), "root");
    }

    #[test]
    fn comm_comparison_is_prefix_limited() {
        assert!(comm_equal("a-very-long-pro", "a-very-long-program-name"));
        assert!(comm_equal("bash", "bash"));
        assert!(!comm_equal("bash", "dash"));
    }

    fn rule_to(dest: &str, controllers: &[&str]) -> Rule {
        Rule {
            uid: RuleId::Wild,
            gid: RuleId::Wild,
            username: "*".into(),
            procname: None,
            destination: dest.into(),
            controllers: controllers.iter().map(|s| s.to_string()).collect(),
            is_ignore: false,
        }
    }

    #[test]
    fn template_walk_creates_missing_prefixes() {
        let root = tempfile::tempdir().unwrap();
        let mut table = MountTable::default();
        table.insert("cpu", root.path(), Version::V1);
        let ctx = Context::with_mounts(table);

        // A template for the substituted leaf, no settings so the
        // scratch tree needs no pre-made control files.
        let mut template = Group::new("students/%u").unwrap();
        template.add_controller("cpu").unwrap();
        ctx.set_templates(vec![template]);

        let rule = rule_to("students/%u", &["cpu"]);
        ctx.create_template_group("students/alice", &rule).unwrap();

        assert!(root.path().join("students").is_dir());
        assert!(root.path().join("students/alice").is_dir());
    }

    #[test]
    fn template_instantiation_applies_template_ownership_shape() {
        let root = tempfile::tempdir().unwrap();
        let mut table = MountTable::default();
        table.insert("cpu", root.path(), Version::V1);
        let ctx = Context::with_mounts(table);

        // No template installed: the leaf still gets a bare group.
        let rule = rule_to("users/%U", &["cpu"]);
        ctx.create_template_group("users/1000", &rule).unwrap();
        assert!(root.path().join("users/1000").is_dir());
    }

    #[test]
    fn existing_prefixes_are_left_alone() {
        let root = tempfile::tempdir().unwrap();
        let mut table = MountTable::default();
        table.insert("cpu", root.path(), Version::V1);
        let ctx = Context::with_mounts(table);

        mkdir_p(&root.path().join("users/1000")).unwrap();
        fs::write(root.path().join("users/1000/marker"), "x").unwrap();

        let rule = rule_to("users/%U", &["cpu"]);
        ctx.create_template_group("users/1000", &rule).unwrap();
        assert!(root.path().join("users/1000/marker").exists());
    }

    #[test]
    fn exist_in_subsystem_checks_the_tree() {
        let root = tempfile::tempdir().unwrap();
        let mut table = MountTable::default();
        table.insert("cpu", root.path(), Version::V1);
        let ctx = Context::with_mounts(table);

        assert!(!ctx.exist_in_subsystem("cpu", "g"));
        mkdir_p(&root.path().join("g")).unwrap();
        assert!(ctx.exist_in_subsystem("cpu", "g"));
        assert!(!ctx.exist_in_subsystem("blkio", "g"));
    }

    #[test]
    fn own_process_identity_is_readable() {
        let pid = std::process::id() as libc::pid_t;
        let (uid, _gid) = uid_gid_of_pid(pid).unwrap();
        assert_eq!(uid, nix::unistd::geteuid().as_raw());

        let name = procname_of_pid(pid).unwrap();
        assert!(!name.is_empty());
        assert!(Path::new(&name).is_absolute() || !name.contains('/'));
    }
}
