//! Bidirectional translation of settings between the cgroup v1 and v2
//! on-disk encodings.
//!
//! Two ordered tables drive the conversion, one per direction. Each row
//! names an input setting, an output setting, and a [`Convert`] variant;
//! the dispatcher in [`convert_with`] enumerates every conversion the
//! crate knows how to perform. Settings with no sensible counterpart
//! carry [`Convert::Unmappable`] and surface as
//! [`ErrorKind::NoVersionConvert`].

use std::path::Path;

use crate::error::*;
use crate::fs::read_control_file;
use crate::group::{Controller, Group};
use crate::path::PathEnv;
use crate::{Context, Version, CGROUP_FILE_PREFIX};

const CPU_MAX: &str = "cpu.max";
const CFS_QUOTA: &str = "cpu.cfs_quota_us";
const CFS_PERIOD: &str = "cpu.cfs_period_us";

/// The kernel's encoding of "no memory limit" on cgroup v1.
const V1_MEM_MAX: &str = "9223372036854771712";

/// One conversion strategy. A closed enum rather than function pointers
/// so the full set of behaviors is enumerable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Convert {
    /// Value unchanged, name unchanged.
    Passthrough,
    /// Value unchanged, name rewritten.
    NameOnly,
    /// Linear scaling: `out = in * out_default / in_default`.
    IntScale { in_dflt: i64, out_dflt: i64 },
    /// v1 `cpu.cfs_quota_us` into the first field of v2 `cpu.max`,
    /// preserving the on-disk period.
    CpuQuotaToMax,
    /// v1 `cpu.cfs_period_us` into the second field of v2 `cpu.max`,
    /// preserving the on-disk quota.
    CpuPeriodToMax,
    /// First field of v2 `cpu.max` ("max" becomes "-1").
    CpuMaxToQuota,
    /// Second field of v2 `cpu.max`.
    CpuMaxToPeriod,
    /// v1 byte limits where "-1" and the kernel sentinel mean "max".
    MemLimitToMax,
    /// v2 "max" back to the kernel sentinel.
    MemMaxToLimit,
    /// `cpuset.cpu_exclusive` "1"/"0" to partition "root"/"member".
    CpusetExclusiveToPartition,
    /// Partition "root"/"member" back to "1"/"0".
    CpusetPartitionToExclusive,
    /// No counterpart exists in the other version.
    Unmappable,
}

struct MapRow {
    convert: Convert,
    in_setting: &'static str,
    out_setting: &'static str,
}

const fn row(convert: Convert, in_setting: &'static str, out_setting: &'static str) -> MapRow {
    MapRow {
        convert,
        in_setting,
        out_setting,
    }
}

#[rustfmt::skip]
static V1_TO_V2: &[MapRow] = &[
    // cpu controller
    row(Convert::IntScale { in_dflt: 1024, out_dflt: 100 }, "cpu.shares", "cpu.weight"),
    row(Convert::CpuQuotaToMax, CFS_QUOTA, CPU_MAX),
    row(Convert::CpuPeriodToMax, CFS_PERIOD, CPU_MAX),
    row(Convert::Unmappable, "cpu.stat", "cpu.stat"),

    // cpuset controller
    row(Convert::NameOnly, "cpuset.effective_cpus", "cpuset.cpus.effective"),
    row(Convert::NameOnly, "cpuset.effective_mems", "cpuset.mems.effective"),
    row(Convert::Passthrough, "cpuset.cpus", "cpuset.cpus"),
    row(Convert::Passthrough, "cpuset.mems", "cpuset.mems"),
    row(Convert::CpusetExclusiveToPartition, "cpuset.cpu_exclusive", "cpuset.cpus.partition"),
    row(Convert::Unmappable, "cpuset.mem_exclusive", ""),
    row(Convert::Unmappable, "cpuset.mem_hardwall", ""),
    row(Convert::Unmappable, "cpuset.memory_migrate", ""),
    row(Convert::Unmappable, "cpuset.memory_pressure", ""),
    row(Convert::Unmappable, "cpuset.mem_pressure_enabled", ""),
    row(Convert::Unmappable, "cpuset.memory_spread_page", ""),
    row(Convert::Unmappable, "cpuset.memory_spread_slab", ""),
    row(Convert::Unmappable, "cpuset.sched_load_balance", ""),
    row(Convert::Unmappable, "cpuset.sched_relax_domain_level", ""),

    // memory controller
    row(Convert::MemLimitToMax, "memory.limit_in_bytes", "memory.max"),
    row(Convert::MemLimitToMax, "memory.soft_limit_in_bytes", "memory.high"),
];

#[rustfmt::skip]
static V2_TO_V1: &[MapRow] = &[
    // cpu controller
    row(Convert::IntScale { in_dflt: 100, out_dflt: 1024 }, "cpu.weight", "cpu.shares"),
    row(Convert::CpuMaxToQuota, CPU_MAX, CFS_QUOTA),
    row(Convert::CpuMaxToPeriod, CPU_MAX, CFS_PERIOD),
    row(Convert::Unmappable, "cpu.stat", "cpu.stat"),

    // cpuset controller
    row(Convert::NameOnly, "cpuset.cpus.effective", "cpuset.effective_cpus"),
    row(Convert::NameOnly, "cpuset.mems.effective", "cpuset.effective_mems"),
    row(Convert::Passthrough, "cpuset.cpus", "cpuset.cpus"),
    row(Convert::Passthrough, "cpuset.mems", "cpuset.mems"),
    row(Convert::CpusetPartitionToExclusive, "cpuset.cpus.partition", "cpuset.cpu_exclusive"),

    // memory controller
    row(Convert::MemMaxToLimit, "memory.max", "memory.limit_in_bytes"),
    row(Convert::MemMaxToLimit, "memory.high", "memory.soft_limit_in_bytes"),
];

fn parse_i64(value: &str) -> Result<i64> {
    value.trim().parse::<i64>().map_err(|err| {
        error!("no integer value in {:?}", value);
        Error::with_cause(ErrorKind::Fail, err)
    })
}

/// Read the current on-disk `cpu.max` of the destination group so one
/// half of a quota/period pair can be rewritten without losing the
/// other half. Falls back to the kernel default when the group does not
/// exist yet.
fn read_cpu_max(env: Option<&PathEnv>, group_name: &str) -> (String, String) {
    let fallback = ("max".to_string(), "100000".to_string());
    let env = match env {
        Some(env) => env,
        None => return fallback,
    };
    let dir = match env.build(Some(group_name), Some("cpu")) {
        Some(dir) => dir,
        None => return fallback,
    };
    let content = match read_control_file(Path::new(&format!("{}{}", dir, CPU_MAX))) {
        Some(content) => content,
        None => return fallback,
    };

    let mut fields = content.split_whitespace();
    match (fields.next(), fields.next()) {
        (Some(quota), Some(period)) => (quota.to_string(), period.to_string()),
        _ => fallback,
    }
}

/// Append the converted form of one input value to `out`.
fn convert_with(
    convert: Convert,
    out: &mut Controller,
    env: Option<&PathEnv>,
    group_name: &str,
    in_value: &str,
    out_setting: &str,
) -> Result<()> {
    // An empty input is a value query: carry the name over unconverted.
    let add_empty = |out: &mut Controller| out.add_setting(out_setting, "").map(|_| ());

    match convert {
        Convert::Passthrough | Convert::NameOnly => {
            out.add_setting(out_setting, in_value).map(|_| ())
        }
        Convert::IntScale { in_dflt, out_dflt } => {
            if in_value.is_empty() {
                return add_empty(out);
            }
            let scaled = parse_i64(in_value)? * out_dflt / in_dflt;
            out.add_setting(out_setting, &scaled.to_string()).map(|_| ())
        }
        Convert::CpuQuotaToMax => {
            if in_value.is_empty() {
                add_empty(out)?;
            } else {
                let (_, period) = read_cpu_max(env, group_name);
                let quota = if in_value == "-1" { "max" } else { in_value };
                out.add_setting(out_setting, &format!("{} {}", quota, period))?;
            }
            if let Some(setting) = out.get_setting_mut(out_setting) {
                setting.prev_name = Some(CFS_QUOTA.to_string());
            }
            Ok(())
        }
        Convert::CpuPeriodToMax => {
            if in_value.is_empty() {
                add_empty(out)?;
            } else {
                let (quota, _) = read_cpu_max(env, group_name);
                let period = if in_value == "-1" { "max" } else { in_value };
                out.add_setting(out_setting, &format!("{} {}", quota, period))?;
            }
            if let Some(setting) = out.get_setting_mut(out_setting) {
                setting.prev_name = Some(CFS_PERIOD.to_string());
            }
            Ok(())
        }
        Convert::CpuMaxToQuota => {
            if in_value.is_empty() {
                return add_empty(out);
            }
            let quota = in_value.split_whitespace().next().unwrap_or("");
            let quota = if quota == "max" { "-1" } else { quota };
            out.add_setting(out_setting, quota).map(|_| ())
        }
        Convert::CpuMaxToPeriod => {
            if in_value.is_empty() {
                return add_empty(out);
            }
            let period = in_value.split_whitespace().nth(1).unwrap_or("");
            out.add_setting(out_setting, period).map(|_| ())
        }
        Convert::MemLimitToMax => {
            if in_value.is_empty() {
                return add_empty(out);
            }
            let value = if in_value == "-1" || in_value == V1_MEM_MAX {
                "max"
            } else {
                in_value
            };
            out.add_setting(out_setting, value).map(|_| ())
        }
        Convert::MemMaxToLimit => {
            if in_value.is_empty() {
                return add_empty(out);
            }
            let value = if in_value == "max" { V1_MEM_MAX } else { in_value };
            out.add_setting(out_setting, value).map(|_| ())
        }
        Convert::CpusetExclusiveToPartition => {
            let value = if in_value == "1" { "root" } else { "member" };
            out.add_setting(out_setting, value).map(|_| ())
        }
        Convert::CpusetPartitionToExclusive => {
            let value = if in_value == "root" { "1" } else { "0" };
            out.add_setting(out_setting, value).map(|_| ())
        }
        Convert::Unmappable => Err(Error::new(ErrorKind::NoVersionConvert)),
    }
}

/// Convert one input setting through every matching table row. The
/// `prev_name` recorded by an earlier N-to-1 conversion disambiguates
/// which reverse row applies.
fn convert_setting(
    out: &mut Controller,
    env: Option<&PathEnv>,
    group_name: &str,
    in_setting: &crate::group::Setting,
) -> Result<()> {
    let table = match out.version {
        Version::V1 => V2_TO_V1,
        Version::V2 => V1_TO_V2,
        _ => return Err(Error::new(ErrorKind::Fail)),
    };

    let mut status = Err(Error::new(ErrorKind::Invalid));
    for entry in table {
        if entry.in_setting != in_setting.name {
            continue;
        }
        if let Some(ref prev) = in_setting.prev_name {
            if prev != entry.out_setting {
                continue;
            }
        }

        status = convert_with(
            entry.convert,
            out,
            env,
            group_name,
            &in_setting.value,
            entry.out_setting,
        );
        if status.is_err() {
            return status;
        }
    }
    status
}

/// Fuse a v1 quota/period pair into one `cpu.max` on the working copy,
/// removing the inputs so the per-setting loop does not see them again.
fn convert_cpu_nto1(out: &mut Controller, input: &mut Controller) -> Result<()> {
    let quota = input.get_setting(CFS_QUOTA).map(|s| s.value.clone());
    let period = input.get_setting(CFS_PERIOD).map(|s| s.value.clone());

    if let (Some(quota), Some(period)) = (quota, period) {
        let quota = if quota == "-1" {
            "max".to_string()
        } else {
            quota
        };
        out.add_setting(CPU_MAX, &format!("{} {}", quota, period))?;
        input.remove_setting(CFS_QUOTA)?;
        input.remove_setting(CFS_PERIOD)?;
    }
    Ok(())
}

/// Convert one controller. Returns the converted controller (or `None`
/// when every setting was unmappable and nothing survived) and whether
/// any unmappable setting was seen.
fn convert_controller(
    env: Option<&PathEnv>,
    group_name: &str,
    input: &Controller,
    out_name: &str,
    out_version: Version,
) -> Result<(Option<Controller>, bool)> {
    let mut out = Controller::new(out_name);
    out.version = out_version;

    if input.version == out.version {
        out.copy_values_from(input);
        return Ok((Some(out), false));
    }

    let mut working = input.clone();
    if working.name == "cpu" && out.version == Version::V2 {
        convert_cpu_nto1(&mut out, &mut working)?;
    }

    let mut unmappable = false;
    for setting in working.settings() {
        match convert_setting(&mut out, env, group_name, setting) {
            Ok(()) => {}
            Err(err) if err.kind() == ErrorKind::NoVersionConvert => {
                // There may be mappable settings after this one.
                unmappable = true;
            }
            Err(err) => return Err(err),
        }
    }

    if unmappable && out.settings().is_empty() {
        // Nothing converted; drop the controller entirely so callers
        // are not left with an empty shell.
        return Ok((None, true));
    }
    Ok((Some(out), unmappable))
}

/// The result of a whole-group conversion. `unmappable` reports that at
/// least one setting had no counterpart; callers decide whether that is
/// fatal.
#[derive(Debug)]
pub struct Converted {
    pub group: Group,
    pub unmappable: bool,
}

impl Context {
    /// Translate one controller into `out_version` encoding.
    /// `Ok(None)` means every setting was unmappable and the controller
    /// was dropped.
    pub fn convert_controller(
        &self,
        group_name: &str,
        input: &Controller,
        out_version: Version,
    ) -> Result<Option<Controller>> {
        let env = self.path_env();
        let mut input = input.clone();
        if input.version == Version::Unknown || input.version == Version::Disk {
            input.version = env.mounts.controller_version(Some(&input.name))?;
        }
        let (converted, _) =
            convert_controller(Some(&env), group_name, &input, &input.name, out_version)?;
        Ok(converted)
    }

    /// Translate every controller of `input` into `out_version`
    /// encoding. `in_version` overrides the version the controllers
    /// declare; pass [`Version::Unknown`] to infer from the mount
    /// table.
    pub fn convert_cgroup(
        &self,
        input: &Group,
        in_version: Version,
        out_version: Version,
    ) -> Result<Converted> {
        let env = self.path_env();
        let mut out_group = Group::new(&input.name)?;
        let mut unmappable = false;

        for in_ctrl in input.controllers() {
            let mut in_ctrl = in_ctrl.clone();
            if in_version == Version::V1 || in_version == Version::V2 {
                in_ctrl.version = in_version;
            }
            if in_ctrl.version == Version::Unknown || in_ctrl.version == Version::Disk {
                in_ctrl.version = env.mounts.controller_version(Some(&in_ctrl.name))?;
            }

            // Only cgroup v2 filesystems expose cgroup.* files.
            let ctrl_out_version = if in_ctrl.name == CGROUP_FILE_PREFIX {
                Version::V2
            } else {
                match out_version {
                    Version::V1 | Version::V2 => out_version,
                    _ => env.mounts.controller_version(Some(&in_ctrl.name))?,
                }
            };

            let (converted, ctrl_unmappable) = convert_controller(
                Some(&env),
                &input.name,
                &in_ctrl,
                &in_ctrl.name,
                ctrl_out_version,
            )?;
            unmappable = unmappable || ctrl_unmappable;

            if let Some(converted) = converted {
                let slot = out_group.add_controller(&converted.name)?;
                *slot = converted;
            }
        }

        Ok(Converted {
            group: out_group,
            unmappable,
        })
    }
}
