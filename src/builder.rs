//! Assemble a [`Group`] with the builder pattern.
//!
//! ```no_run
//! use cgroupctl::GroupBuilder;
//!
//! let group = GroupBuilder::new("daily/backup")
//!     .controller("cpu")
//!         .setting("cpu.shares", "512")
//!         .done()
//!     .controller("memory")
//!         .setting("memory.limit_in_bytes", "1073741824")
//!         .done()
//!     .owners(Some(0), Some(0), Some(0), Some(0))
//!     .permissions(Some(0o755), Some(0o644), Some(0o664))
//!     .build()
//!     .unwrap();
//! # let _ = group;
//! ```

use crate::error::*;
use crate::group::Group;

/// Builder for a [`Group`]. Validation is deferred to [`GroupBuilder::build`].
pub struct GroupBuilder {
    name: String,
    controllers: Vec<(String, Vec<(String, String)>)>,
    tasks_owner: (Option<u32>, Option<u32>),
    control_owner: (Option<u32>, Option<u32>),
    perms: (Option<u32>, Option<u32>, Option<u32>),
}

impl GroupBuilder {
    /// Start building a group with the supplied name.
    pub fn new(name: &str) -> GroupBuilder {
        GroupBuilder {
            name: name.to_string(),
            controllers: Vec::new(),
            tasks_owner: (None, None),
            control_owner: (None, None),
            perms: (None, None, None),
        }
    }

    /// Open a controller section; close it with [`ControllerBuilder::done`].
    pub fn controller(mut self, name: &str) -> ControllerBuilder {
        self.controllers.push((name.to_string(), Vec::new()));
        ControllerBuilder { group: self }
    }

    /// Owners for the tasks file and the control files.
    pub fn owners(
        mut self,
        tasks_uid: Option<u32>,
        tasks_gid: Option<u32>,
        control_uid: Option<u32>,
        control_gid: Option<u32>,
    ) -> Self {
        self.tasks_owner = (tasks_uid, tasks_gid);
        self.control_owner = (control_uid, control_gid);
        self
    }

    /// Modes for the group directory, the control files, and the tasks
    /// file. `None` inherits.
    pub fn permissions(
        mut self,
        control_dperm: Option<u32>,
        control_fperm: Option<u32>,
        task_fperm: Option<u32>,
    ) -> Self {
        self.perms = (control_dperm, control_fperm, task_fperm);
        self
    }

    /// Finalize the group, consuming the builder.
    pub fn build(self) -> Result<Group> {
        let mut group = Group::new(&self.name)?;
        for (name, settings) in &self.controllers {
            let controller = group.add_controller(name)?;
            for (setting, value) in settings {
                controller.add_setting(setting, value)?;
            }
        }
        group.set_uid_gid(
            self.tasks_owner.0,
            self.tasks_owner.1,
            self.control_owner.0,
            self.control_owner.1,
        );
        group.set_permissions(self.perms.0, self.perms.1, self.perms.2);
        Ok(group)
    }
}

/// Builds one controller section of a [`GroupBuilder`].
pub struct ControllerBuilder {
    group: GroupBuilder,
}

impl ControllerBuilder {
    /// Add a (name, value) setting to this controller.
    pub fn setting(mut self, name: &str, value: &str) -> Self {
        if let Some(last) = self.group.controllers.last_mut() {
            last.1.push((name.to_string(), value.to_string()));
        }
        self
    }

    /// Close the controller section.
    pub fn done(self) -> GroupBuilder {
        self.group
    }
}
