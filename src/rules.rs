//! The rules database: parsing of the rules configuration, and the
//! matcher that resolves a process identity to a destination group.
//!
//! One rule per line:
//!
//! ```text
//! <user>[:<procname>]  <controller-list>  <destination>  [<options>]
//! ```
//!
//! `<user>` is a login name, `@group`, `*` (any identity), or `%`
//! (continuation of the previous rule). `#` starts a comment. The only
//! recognized option is `ignore`. A configuration directory is parsed
//! after the main file, its files ordered lexicographically.

use std::fmt;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use nix::unistd::{Group as NixGroup, Uid, User};
use regex::Regex;

use crate::error::*;
use crate::{Context, MAX_MNT_ELEMENTS, MAX_PATH_LEN};

/// Flag value understood by the daemon registry: descendants of the pid
/// inherit the don't-reclassify mark.
pub const FLAG_UNCHANGE_CHILDREN: i32 = 1;

/// Flag value that removes a pid from the daemon registry instead of
/// adding it.
pub const FLAG_CANCEL_UNCHANGE: i32 = 2;

/// An identity selector in a rule: a concrete id, the wildcard, or
/// nothing (e.g. the gid of a plain-user rule).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleId {
    Id(u32),
    Wild,
    Invalid,
}

impl RuleId {
    fn matches(self, id: u32) -> bool {
        self == RuleId::Id(id)
    }
}

/// One parsed rule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rule {
    pub uid: RuleId,
    pub gid: RuleId,
    /// The raw user field: a login name, `@group`, `*`, or a leading
    /// `%` for continuation rules.
    pub username: String,
    pub procname: Option<String>,
    pub destination: String,
    pub controllers: Vec<String>,
    pub is_ignore: bool,
}

impl Rule {
    /// Continuation rules extend the previous rule's action list and
    /// are never matched as heads.
    pub fn is_continuation(&self) -> bool {
        self.username.starts_with('%')
    }
}

impl fmt::Display for Rule {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{}{} -> {} [{}]{}",
            self.username,
            self.procname
                .as_ref()
                .map(|p| format!(":{}", p))
                .unwrap_or_default(),
            self.destination,
            self.controllers.join(","),
            if self.is_ignore { " (ignore)" } else { "" }
        )
    }
}

/// The ordered rule list. Replaced atomically under the context's rules
/// lock on reload.
#[derive(Debug, Clone, Default)]
pub struct RuleList {
    pub(crate) rules: Vec<Rule>,
}

/// What the matcher decided for one process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MatchOutcome {
    /// The head rule plus its `%`-continuations, in order.
    Match(Vec<Rule>),
    /// An ignore rule matched: leave the process alone.
    Ignore,
    /// Nothing matched.
    NoMatch,
}

/// `rule_procname` ends with `*`: prefix-match it. A bare `*` matches
/// any non-empty name.
pub(crate) fn wildcard_procname_matches(rule_procname: &str, procname: &str) -> bool {
    if !rule_procname.ends_with('*') {
        return false;
    }
    let prefix = &rule_procname[..rule_procname.len() - 1];
    if prefix.is_empty() {
        return !procname.is_empty();
    }
    procname.starts_with(prefix)
}

fn basename(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

/// Whether a rule's procname field accepts this process, trying the
/// full name, its basename, and the trailing-`*` wildcard against both.
fn procname_matches(rule_procname: &str, procname: &str) -> bool {
    if rule_procname == procname || rule_procname == basename(procname) {
        return true;
    }
    wildcard_procname_matches(rule_procname, procname)
        || wildcard_procname_matches(rule_procname, basename(procname))
}

/// One line of `/proc/<pid>/cgroup`, reduced to the comma-split
/// controller list and the cgroup path with its leading `/` stripped
/// (kept only for the root group).
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct PidCgroupLine {
    pub controllers: Vec<String>,
    pub path: String,
}

pub(crate) fn normalize_cgroup_path(pathname: &str) -> String {
    if pathname.len() > 1 {
        pathname.trim_start_matches('/').to_string()
    } else {
        pathname.to_string()
    }
}

/// Find the pid cgroup entry whose path sits under the rule's
/// destination. A trailing `/` in the destination demands the match
/// fall on a directory boundary.
pub(crate) fn find_matching_destination<'a>(
    lines: &'a [PidCgroupLine],
    rule_dest: &str,
) -> Option<&'a PidCgroupLine> {
    let full_len = rule_dest.len();
    for line in lines {
        let mut cmp_len = full_len;
        if rule_dest.ends_with('/') {
            if line.path.len() >= full_len && line.path.as_bytes()[full_len - 1] != b'/' {
                continue;
            }
            cmp_len -= 1;
        }
        if line.path.len() >= cmp_len && line.path[..cmp_len] == rule_dest[..cmp_len] {
            return Some(line);
        }
    }
    None
}

/// Decide whether an ignore rule applies to this pid: the pid must
/// actually live under the rule's destination on a hierarchy that
/// carries one of the rule's controllers, and the procname field (if
/// any) must accept the process.
pub(crate) fn ignore_rule_matches(
    rule: &Rule,
    pid_cgroups: &[PidCgroupLine],
    procname: &str,
) -> bool {
    if !rule.is_ignore {
        return false;
    }

    let line = match find_matching_destination(pid_cgroups, &rule.destination) {
        Some(line) => line,
        None => return false,
    };

    let controller_hit = line
        .controllers
        .iter()
        .any(|c| rule.controllers.iter().any(|rc| rc == c));
    if !controller_hit {
        return false;
    }

    match rule.procname {
        None => true,
        Some(ref rule_procname) => {
            rule_procname == procname || wildcard_procname_matches(rule_procname, procname)
        }
    }
}

fn read_pid_cgroups(pid: libc::pid_t) -> Result<Vec<PidCgroupLine>> {
    let process = procfs::process::Process::new(pid)?;
    let mut lines = Vec::new();
    for cg in process.cgroups()? {
        if cg.controllers.is_empty() {
            // The unified v2 entry (`0::/...`) names no controller.
            continue;
        }
        lines.push(PidCgroupLine {
            controllers: cg.controllers.clone(),
            path: normalize_cgroup_path(&cg.pathname),
        });
        if lines.len() >= MAX_MNT_ELEMENTS {
            warn!("maximum mount elements reached while reading pid {} cgroups", pid);
            break;
        }
    }
    Ok(lines)
}

/// Identity check for one head rule: uid, gid, wildcard, or membership
/// in an `@group`.
fn identity_matches(rule: &Rule, uid: u32, gid: u32) -> bool {
    if rule.uid == RuleId::Wild && rule.gid == RuleId::Wild {
        return true;
    }
    if rule.uid.matches(uid) || rule.gid.matches(gid) {
        return true;
    }

    if let Some(group_name) = rule.username.strip_prefix('@') {
        let group = match NixGroup::from_name(group_name) {
            Ok(Some(group)) => group,
            _ => return false,
        };
        let user = match User::from_uid(Uid::from_raw(uid)) {
            Ok(Some(user)) => user,
            _ => return false,
        };
        return group.mem.iter().any(|member| *member == user.name);
    }

    false
}

impl RuleList {
    /// Scan the rules in order and resolve a process identity.
    pub(crate) fn find_match(
        &self,
        uid: u32,
        gid: u32,
        pid: libc::pid_t,
        procname: Option<&str>,
    ) -> MatchOutcome {
        let mut pid_cgroups: Option<Vec<PidCgroupLine>> = None;

        let mut idx = 0;
        while idx < self.rules.len() {
            let rule = &self.rules[idx];
            idx += 1;

            if rule.is_continuation() {
                continue;
            }
            if !identity_matches(rule, uid, gid) {
                continue;
            }

            if rule.is_ignore {
                // Lazily read the pid's cgroup memberships; several
                // ignore rules may need them.
                if pid_cgroups.is_none() {
                    pid_cgroups = Some(read_pid_cgroups(pid).unwrap_or_default());
                }
                let name = procname.unwrap_or("");
                if ignore_rule_matches(rule, pid_cgroups.as_ref().unwrap(), name) {
                    return MatchOutcome::Ignore;
                }
                continue;
            }

            let matched = match (procname, &rule.procname) {
                (_, None) => true,
                // No process name to compare against: a uid/gid match
                // is enough.
                (None, Some(_)) => true,
                (Some(procname), Some(rule_procname)) => {
                    procname_matches(rule_procname, procname)
                }
            };
            if !matched {
                continue;
            }

            // Collect the head and its continuations.
            let mut matched_rules = vec![self.rules[idx - 1].clone()];
            while idx < self.rules.len() && self.rules[idx].is_continuation() {
                matched_rules.push(self.rules[idx].clone());
                idx += 1;
            }
            return MatchOutcome::Match(matched_rules);
        }

        MatchOutcome::NoMatch
    }
}

/// Strip comments and surrounding blanks; `None` means the line is
/// empty.
fn significant_part(line: &str) -> Option<&str> {
    let line = match line.find('#') {
        Some(idx) => &line[..idx],
        None => line,
    };
    let line = line.trim();
    if line.is_empty() {
        None
    } else {
        Some(line)
    }
}

/// Parse the options field. The only supported option is `ignore`;
/// anything else rejects the line.
pub(crate) fn parse_rule_options(options: &str, rule: &mut Rule) -> Result<()> {
    for option in options.split(',') {
        if option == "ignore" {
            rule.is_ignore = true;
            continue;
        }
        error!("unsupported rule option: {}", option);
        return Err(Error::new(ErrorKind::ParseFail));
    }
    Ok(())
}

struct ParserState {
    /// The previous head was skipped (unknown user), so its
    /// continuations must be skipped too.
    skipped: bool,
}

/// Parse one rules file, appending to `rules`.
fn parse_rules_file(path: &Path, rules: &mut Vec<Rule>, state: &mut ParserState) -> Result<()> {
    let file = match File::open(path) {
        Ok(file) => file,
        Err(err) => {
            warn!("failed to open rules file {}: {}", path.display(), err);
            return Err(Error::new(ErrorKind::RulesFileMissing));
        }
    };

    let key_re = Regex::new(r"^(?P<user>[^:\s]+)(?::(?P<proc>\S+))?$").unwrap();

    debug!("parsing rules file {}", path.display());
    for (lineno, line) in BufReader::new(file).lines().enumerate() {
        let lineno = lineno + 1;
        let line = line.map_err(Error::from_os)?;
        let line = match significant_part(&line) {
            Some(line) => line,
            None => continue,
        };

        if state.skipped && line.starts_with('%') {
            warn!("skipped child of invalid rule, line {}", lineno);
            continue;
        }
        state.skipped = false;

        let mut fields = line.split_whitespace();
        let (key, controllers, destination) =
            match (fields.next(), fields.next(), fields.next()) {
                (Some(key), Some(controllers), Some(destination)) => {
                    (key, controllers, destination)
                }
                _ => {
                    error!("failed to parse rules on line {}", lineno);
                    return Err(Error::new(ErrorKind::ParseFail));
                }
            };
        let options = fields.next();

        let caps = match key_re.captures(key) {
            Some(caps) => caps,
            None => {
                error!("failed to parse rule key on line {}", lineno);
                return Err(Error::new(ErrorKind::ParseFail));
            }
        };
        let user = caps.name("user").map(|m| m.as_str()).unwrap_or("");
        let procname = caps.name("proc").map(|m| m.as_str().to_string());

        let (uid, gid) = if let Some(group_name) = user.strip_prefix('@') {
            match NixGroup::from_name(group_name) {
                Ok(Some(group)) => (RuleId::Invalid, RuleId::Id(group.gid.as_raw())),
                _ => {
                    warn!(
                        "entry for {} not found, skipping rule on line {}",
                        group_name, lineno
                    );
                    state.skipped = true;
                    continue;
                }
            }
        } else if user == "*" {
            (RuleId::Wild, RuleId::Wild)
        } else if user.starts_with('%') {
            (RuleId::Invalid, RuleId::Invalid)
        } else {
            match User::from_name(user) {
                Ok(Some(pwd)) => (RuleId::Id(pwd.uid.as_raw()), RuleId::Invalid),
                _ => {
                    warn!(
                        "entry for {} not found, skipping rule on line {}",
                        user, lineno
                    );
                    state.skipped = true;
                    continue;
                }
            }
        };

        if destination.len() > MAX_PATH_LEN {
            error!("destination too long on line {}", lineno);
            return Err(Error::new(ErrorKind::ParseFail));
        }

        let mut rule = Rule {
            uid,
            gid,
            username: user.to_string(),
            procname,
            destination: destination.to_string(),
            controllers: Vec::new(),
            is_ignore: false,
        };

        for controller in controllers.split(',') {
            if controller.is_empty() {
                error!("failed to parse controllers on line {}", lineno);
                return Err(Error::new(ErrorKind::ParseFail));
            }
            if rule.controllers.len() >= MAX_MNT_ELEMENTS {
                error!("too many controllers listed on line {}", lineno);
                return Err(Error::new(ErrorKind::ParseFail));
            }
            rule.controllers.push(controller.to_string());
        }

        if let Some(options) = options {
            parse_rule_options(options, &mut rule)?;
        }

        debug!("added rule {}", rule);
        rules.push(rule);
    }

    Ok(())
}

/// Parse the main rules file plus every regular file in the drop-in
/// directory, lexicographically by filename.
pub(crate) fn parse_rules(file: &Path, dir: &Path) -> Result<RuleList> {
    let mut rules = Vec::new();
    let mut state = ParserState { skipped: false };

    parse_rules_file(file, &mut rules, &mut state)?;

    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(err) => {
            // No drop-in directory is fine; the main file stands alone.
            debug!("not reading rules directory {}: {}", dir.display(), err);
            return Ok(RuleList { rules });
        }
    };

    let mut names: Vec<_> = entries
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().map(|t| t.is_file() || t.is_symlink()).unwrap_or(false))
        .map(|e| e.path())
        .collect();
    names.sort();

    for path in names {
        parse_rules_file(&path, &mut rules, &mut state)?;
    }

    Ok(RuleList { rules })
}

impl Context {
    /// Parse the rules configuration into a fresh list and swap it in.
    /// On failure the previous list keeps serving matches.
    pub fn load_rules(&self) -> Result<()> {
        let (file, dir) = self.rules_path.read().unwrap().clone();
        let fresh = parse_rules(&file, &dir)?;
        *self.rules.write().unwrap() = fresh;
        Ok(())
    }

    /// Alias of [`Context::load_rules`]; the daemon calls this on
    /// SIGUSR2.
    pub fn reload_rules(&self) -> Result<()> {
        self.load_rules()
    }

    /// Resolve a process identity against the cached rule list.
    pub fn match_rule(
        &self,
        uid: u32,
        gid: u32,
        pid: libc::pid_t,
        procname: Option<&str>,
    ) -> MatchOutcome {
        self.rules.read().unwrap().find_match(uid, gid, pid, procname)
    }

    /// Resolve against a freshly parsed list without touching the
    /// cache.
    pub fn match_rule_uncached(
        &self,
        uid: u32,
        gid: u32,
        pid: libc::pid_t,
        procname: Option<&str>,
    ) -> Result<MatchOutcome> {
        let (file, dir) = self.rules_path.read().unwrap().clone();
        let fresh = parse_rules(&file, &dir)?;
        Ok(fresh.find_match(uid, gid, pid, procname))
    }

    /// A copy of the cached rules, for logging and inspection.
    pub fn rules_snapshot(&self) -> Vec<Rule> {
        self.rules.read().unwrap().rules.clone()
    }

    /// Whether the rule cache is empty (nothing loaded yet).
    pub fn rules_loaded(&self) -> bool {
        !self.rules.read().unwrap().rules.is_empty()
    }
}

/// Client side of the daemon control socket: mark a pid as "do not
/// reclassify" (optionally inheriting to children), or cancel the mark
/// with [`FLAG_CANCEL_UNCHANGE`]. A daemon that is not running counts
/// as success.
pub fn register_unchanged_process<P: AsRef<Path>>(
    socket_path: P,
    pid: libc::pid_t,
    flags: i32,
) -> Result<()> {
    use std::io::{Read, Write};
    use std::os::unix::net::UnixStream;

    let mut stream = match UnixStream::connect(socket_path.as_ref()) {
        Ok(stream) => stream,
        Err(_) => return Ok(()),
    };

    stream
        .write_all(&pid.to_ne_bytes())
        .map_err(Error::from_os)?;
    stream
        .write_all(&flags.to_ne_bytes())
        .map_err(Error::from_os)?;

    let mut reply = [0u8; crate::daemon::SUCCESS_REPLY.len()];
    stream.read_exact(&mut reply).map_err(Error::from_os)?;
    if reply[..] != *crate::daemon::SUCCESS_REPLY {
        return Err(Error::new(ErrorKind::Fail));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_rules(dir: &Path, name: &str, content: &str) -> std::path::PathBuf {
        let path = dir.join(name);
        let mut f = File::create(&path).unwrap();
        f.write_all(content.as_bytes()).unwrap();
        path
    }

    fn parse_str(content: &str) -> Result<RuleList> {
        let dir = tempfile::tempdir().unwrap();
        let file = write_rules(dir.path(), "cgrules.conf", content);
        parse_rules(&file, &dir.path().join("cgrules.d"))
    }

    #[test]
    fn parses_wildcard_and_continuation_rules() {
        let list = parse_str(
            "# comment\n\
             *:ftp*  cpu,memory  daemons/ftp  \n\
             %       net_cls     daemons/net\n",
        )
        .unwrap();

        assert_eq!(list.rules.len(), 2);
        let head = &list.rules[0];
        assert_eq!(head.uid, RuleId::Wild);
        assert_eq!(head.procname.as_deref(), Some("ftp*"));
        assert_eq!(head.controllers, vec!["cpu", "memory"]);
        assert_eq!(head.destination, "daemons/ftp");
        assert!(!head.is_ignore);
        assert!(list.rules[1].is_continuation());
    }

    #[test]
    fn ignore_option_is_parsed() {
        let list = parse_str("*  cpu  mygrp  ignore\n").unwrap();
        assert!(list.rules[0].is_ignore);
    }

    #[test]
    fn unknown_option_rejects_the_configuration() {
        let err = parse_str("*  cpu  mygrp  ignore,frobnicate\n").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ParseFail);
    }

    #[test]
    fn unknown_user_skips_rule_and_its_continuations() {
        let list = parse_str(
            "no_such_user_here  cpu  grp\n\
             %                  memory grp2\n\
             *                  cpu  fallback\n",
        )
        .unwrap();
        assert_eq!(list.rules.len(), 1);
        assert_eq!(list.rules[0].destination, "fallback");
    }

    #[test]
    fn missing_main_file_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let err = parse_rules(&dir.path().join("absent.conf"), dir.path()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::RulesFileMissing);
    }

    #[test]
    fn drop_in_files_are_parsed_in_lexicographic_order() {
        let dir = tempfile::tempdir().unwrap();
        let file = write_rules(dir.path(), "cgrules.conf", "*  cpu  main\n");
        let sub = dir.path().join("cgrules.d");
        std::fs::create_dir(&sub).unwrap();
        write_rules(&sub, "20-second.conf", "*  cpu  second\n");
        write_rules(&sub, "10-first.conf", "*  cpu  first\n");

        let list = parse_rules(&file, &sub).unwrap();
        let dests: Vec<&str> = list.rules.iter().map(|r| r.destination.as_str()).collect();
        assert_eq!(dests, vec!["main", "first", "second"]);
    }

    #[test]
    fn wildcard_procname_semantics() {
        assert!(wildcard_procname_matches("*", "bash"));
        assert!(!wildcard_procname_matches("*", ""));
        assert!(wildcard_procname_matches("foo*", "foo"));
        assert!(wildcard_procname_matches("foo*", "foobar"));
        assert!(!wildcard_procname_matches("foo*", "fo"));
        assert!(!wildcard_procname_matches("foo", "foobar"));
    }

    #[test]
    fn matcher_walks_rules_in_order() {
        let list = parse_str(
            "*:/usr/bin/prog  cpu  progs\n\
             *                cpu  everyone\n",
        )
        .unwrap();

        match list.find_match(1000, 1000, 1, Some("/usr/bin/prog")) {
            MatchOutcome::Match(rules) => assert_eq!(rules[0].destination, "progs"),
            other => panic!("unexpected outcome {:?}", other),
        }

        // A different absolute path must not match, but the basename
        // rule form does.
        match list.find_match(1000, 1000, 1, Some("/usr/local/bin/prog")) {
            MatchOutcome::Match(rules) => assert_eq!(rules[0].destination, "everyone"),
            other => panic!("unexpected outcome {:?}", other),
        }
    }

    #[test]
    fn basename_rule_matches_full_path() {
        let list = parse_str("*:prog  cpu  progs\n").unwrap();
        match list.find_match(0, 0, 1, Some("/usr/bin/prog")) {
            MatchOutcome::Match(rules) => assert_eq!(rules[0].destination, "progs"),
            other => panic!("unexpected outcome {:?}", other),
        }
    }

    #[test]
    fn continuations_ride_along_with_the_head() {
        let list = parse_str(
            "*   cpu     first\n\
             %   memory  second\n\
             %   pids    third\n",
        )
        .unwrap();

        match list.find_match(42, 42, 1, None) {
            MatchOutcome::Match(rules) => {
                let dests: Vec<&str> = rules.iter().map(|r| r.destination.as_str()).collect();
                assert_eq!(dests, vec!["first", "second", "third"]);
            }
            other => panic!("unexpected outcome {:?}", other),
        }
    }

    #[test]
    fn destination_matching_honors_directory_boundaries() {
        let lines = vec![
            PidCgroupLine {
                controllers: vec!["cpu".into()],
                path: "folder1".into(),
            },
            PidCgroupLine {
                controllers: vec!["memory".into()],
                path: "folder/child".into(),
            },
        ];

        // "folder/" must not match "folder1".
        let hit = find_matching_destination(&lines, "folder/").unwrap();
        assert_eq!(hit.path, "folder/child");

        // Plain prefixes do match.
        let hit = find_matching_destination(&lines, "folder1").unwrap();
        assert_eq!(hit.path, "folder1");

        assert!(find_matching_destination(&lines, "elsewhere").is_none());
    }

    #[test]
    fn ignore_rule_requires_destination_and_controller() {
        let rule = Rule {
            uid: RuleId::Wild,
            gid: RuleId::Wild,
            username: "*".into(),
            procname: None,
            destination: "mygrp".into(),
            controllers: vec!["cpu".into()],
            is_ignore: true,
        };

        let in_group = vec![PidCgroupLine {
            controllers: vec!["cpu".into()],
            path: "mygrp".into(),
        }];
        assert!(ignore_rule_matches(&rule, &in_group, "prog"));

        let elsewhere = vec![PidCgroupLine {
            controllers: vec!["cpu".into()],
            path: "other".into(),
        }];
        assert!(!ignore_rule_matches(&rule, &elsewhere, "prog"));

        // Destination matches but on a hierarchy without the rule's
        // controllers: no match.
        let wrong_controller = vec![PidCgroupLine {
            controllers: vec!["memory".into()],
            path: "mygrp".into(),
        }];
        assert!(!ignore_rule_matches(&rule, &wrong_controller, "prog"));
    }

    #[test]
    fn normalized_paths_strip_the_leading_slash_except_root() {
        assert_eq!(normalize_cgroup_path("/mygrp"), "mygrp");
        assert_eq!(normalize_cgroup_path("/"), "/");
    }
}
