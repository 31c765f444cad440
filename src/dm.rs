//! Live device-mapper devices.
//!
//! The raw `DM_*` ioctl transport is an external collaborator; [`DeviceMapper`]
//! is the seam the orchestrator talks to.  The production implementation
//! drives the `dmsetup` binary, kept isolated here so the composition and
//! orchestration above stay testable against a recording fake.

use std::{io, path::PathBuf, process::Command};

use thiserror::Error;

use crate::dmtable::DmTarget;

#[derive(Error, Debug)]
pub enum DmError {
    #[error("failed to spawn {binary:?}")]
    Spawn {
        binary: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("creating dm device '{name}' failed: {stderr}")]
    Create { name: String, stderr: String },
    #[error("removing dm device '{name}' failed: {stderr}")]
    Remove { name: String, stderr: String },
}

/// Interface to the kernel device-mapper.
pub trait DeviceMapper {
    /// Create a live device from `target` and return its node path.
    ///
    /// Atomic: either the device exists and is live afterwards, or the call
    /// failed and left no residue.
    fn create(&self, target: &DmTarget) -> Result<PathBuf, DmError>;

    /// Tear down a device created earlier.
    fn remove(&self, name: &str) -> Result<(), DmError>;
}

/// [`DeviceMapper`] backed by the `dmsetup` binary.
#[derive(Debug, Clone)]
pub struct Dmsetup {
    binary: PathBuf,
}

impl Default for Dmsetup {
    fn default() -> Self {
        Self {
            binary: PathBuf::from("dmsetup"),
        }
    }
}

/// Full kernel table line: logical start sector, length, target type,
/// target parameters.
fn table_line(target: &DmTarget) -> String {
    format!(
        "0 {} {} {}",
        target.sectors,
        target.kind.as_str(),
        target.table
    )
}

impl Dmsetup {
    pub fn new(binary: PathBuf) -> Self {
        Self { binary }
    }
}

impl DeviceMapper for Dmsetup {
    fn create(&self, target: &DmTarget) -> Result<PathBuf, DmError> {
        let mut cmd = Command::new(&self.binary);
        cmd.args(["create", &target.name, "--uuid", &target.uuid]);
        if target.readonly {
            cmd.arg("--readonly");
        }
        cmd.args(["--table", &table_line(target)]);
        let output = cmd.output().map_err(|source| DmError::Spawn {
            binary: self.binary.clone(),
            source,
        })?;
        if !output.status.success() {
            // a failed create may leave an unresolved node behind; make sure
            // nothing lingers before reporting the failure
            let _ = self.remove(&target.name);
            return Err(DmError::Create {
                name: target.name.clone(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(PathBuf::from(format!("/dev/mapper/{}", target.name)))
    }

    fn remove(&self, name: &str) -> Result<(), DmError> {
        let output = Command::new(&self.binary)
            .args(["remove", name])
            .output()
            .map_err(|source| DmError::Spawn {
                binary: self.binary.clone(),
                source,
            })?;
        if !output.status.success() {
            return Err(DmError::Remove {
                name: name.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(())
    }
}

/// Teardown guard over the devices activated so far.
///
/// On drop, removes them in reverse order of creation unless [`disarm`ed]
/// first; removal failures are logged and do not stop the remaining
/// teardown.  This is what keeps error paths free of leftover dm devices.
///
/// [`disarm`ed]: ActivationGuard::disarm
pub struct ActivationGuard<'a> {
    dm: &'a dyn DeviceMapper,
    active: Vec<String>,
    armed: bool,
}

impl<'a> ActivationGuard<'a> {
    pub fn new(dm: &'a dyn DeviceMapper) -> Self {
        Self {
            dm,
            active: Vec::new(),
            armed: true,
        }
    }

    pub fn push(&mut self, name: String) {
        self.active.push(name);
    }

    /// The stack is complete; keep the devices.
    pub fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for ActivationGuard<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        for name in self.active.iter().rev() {
            if let Err(e) = self.dm.remove(name) {
                crate::etrace!("cleanup of dm device '{name}' failed: {e}");
            }
        }
    }
}


#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;

    use super::{fake::RecordingDm, *};
    use crate::dmtable::DmTargetKind;

    fn target(name: &str) -> DmTarget {
        DmTarget {
            name: name.to_string(),
            uuid: format!("rootprep-{name}"),
            kind: DmTargetKind::Verity,
            sectors: 8192,
            table: "1 /dev/sda2 /dev/sda2 4096 4096 1024 1024 sha256 ab cd".to_string(),
            readonly: true,
        }
    }

    #[test]
    fn test_table_line() {
        assert_eq!(
            table_line(&target("rootfs-verint")),
            "0 8192 verity 1 /dev/sda2 /dev/sda2 4096 4096 1024 1024 sha256 ab cd"
        );
    }

    #[test]
    fn test_guard_reverse_teardown() {
        let dm = RecordingDm::default();
        {
            let mut guard = ActivationGuard::new(&dm);
            dm.create(&target("a")).unwrap();
            guard.push("a".to_string());
            dm.create(&target("b")).unwrap();
            guard.push("b".to_string());
        }
        assert_eq!(
            *dm.ops.borrow(),
            vec!["create a", "create b", "remove b", "remove a"]
        );
    }

    #[test]
    fn test_guard_disarm() {
        let dm = RecordingDm::default();
        let mut guard = ActivationGuard::new(&dm);
        dm.create(&target("a")).unwrap();
        guard.push("a".to_string());
        guard.disarm();
        assert_eq!(*dm.ops.borrow(), vec!["create a"]);
    }
}
