//! Persistence of VM descriptors: one directory per VM, keyed by name.

use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};

use nix::fcntl::{Flock, FlockArg};
use tokio_util::sync::CancellationToken;

use crate::descriptor::VmDescriptor;
use crate::error::VmError;
use crate::paths::{self, VmPaths};
use crate::runner::CommandRunner;
use crate::supervisor::ProcessSupervisor;

/// Exclusive advisory lock on one VM name, released on drop.
pub struct VmLock {
    _flock: Flock<File>,
}

#[derive(Debug, Clone)]
pub struct VmStore {
    vms_dir: PathBuf,
}

impl VmStore {
    pub fn new(vms_dir: impl Into<PathBuf>) -> Self {
        Self {
            vms_dir: vms_dir.into(),
        }
    }

    pub fn vms_dir(&self) -> &Path {
        &self.vms_dir
    }

    pub fn paths(&self, name: &str) -> VmPaths {
        VmPaths::new(&self.vms_dir, name)
    }

    /// Serialize operations on one name across processes. Waits if another
    /// invocation holds the lock, until it is released or `cancel` fires.
    ///
    /// The lock file outlives the VM: unlinking it while others wait would
    /// let a waiter and a newcomer lock two different inodes.
    pub async fn lock(&self, name: &str, cancel: &CancellationToken) -> Result<VmLock, VmError> {
        fs::create_dir_all(&self.vms_dir)
            .map_err(|e| VmError::io(format!("creating {}", self.vms_dir.display()), e))?;
        let path = paths::lock_path(&self.vms_dir, name);
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)
            .map_err(|e| VmError::io(format!("opening lock {}", path.display()), e))?;
        let lock_err = |errno: nix::errno::Errno| VmError::io(format!("locking {}", path.display()), errno.into());

        let flock = match Flock::lock(file, FlockArg::LockExclusiveNonblock) {
            Ok(l) => l,
            Err((file, nix::errno::Errno::EWOULDBLOCK)) => {
                tracing::info!(name, "another lazyvm command is working on this VM, waiting");
                let waiting = tokio::task::spawn_blocking(move || Flock::lock(file, FlockArg::LockExclusive));
                tokio::select! {
                    _ = cancel.cancelled() => return Err(VmError::Cancelled),
                    joined = waiting => match joined {
                        Ok(Ok(l)) => l,
                        Ok(Err((_, errno))) => return Err(lock_err(errno)),
                        Err(e) => return Err(VmError::io(format!("locking {}", path.display()), std::io::Error::other(e))),
                    },
                }
            }
            Err((_, errno)) => return Err(lock_err(errno)),
        };
        tracing::debug!(name, path = %path.display(), "lock acquired");
        Ok(VmLock { _flock: flock })
    }

    /// Create the VM directory and write its first descriptor.
    pub fn create(&self, descriptor: &VmDescriptor) -> Result<VmPaths, VmError> {
        fs::create_dir_all(&self.vms_dir)
            .map_err(|e| VmError::io(format!("creating {}", self.vms_dir.display()), e))?;
        let paths = self.paths(&descriptor.name);
        match fs::create_dir(paths.dir()) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                return Err(VmError::AlreadyExists {
                    name: descriptor.name.clone(),
                });
            }
            Err(e) => {
                return Err(VmError::io(format!("creating {}", paths.dir().display()), e));
            }
        }
        if let Err(e) = write_descriptor(&paths, descriptor) {
            let _ = fs::remove_dir_all(paths.dir());
            return Err(e);
        }
        tracing::info!(name = %descriptor.name, dir = %paths.dir().display(), "descriptor created");
        Ok(paths)
    }

    pub fn load(&self, name: &str) -> Result<VmDescriptor, VmError> {
        let paths = self.paths(name);
        let path = paths.descriptor();
        let raw = match fs::read_to_string(&path) {
            Ok(r) => r,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(VmError::NotFound { name: name.to_string() });
            }
            Err(e) => return Err(VmError::io(format!("reading {}", path.display()), e)),
        };
        let corrupt = |message: String| VmError::CorruptState {
            name: name.to_string(),
            path: path.display().to_string(),
            message,
        };
        let descriptor: VmDescriptor = facet_json::from_str(&raw).map_err(|e| corrupt(e.to_string()))?;
        if descriptor.name != name {
            return Err(corrupt(format!("records name '{}'", descriptor.name)));
        }
        Ok(descriptor)
    }

    /// Overwrite an existing descriptor. The name is immutable, so this
    /// never creates a directory.
    pub fn save(&self, descriptor: &VmDescriptor) -> Result<(), VmError> {
        let paths = self.paths(&descriptor.name);
        if !paths.dir().is_dir() {
            return Err(VmError::NotFound {
                name: descriptor.name.clone(),
            });
        }
        write_descriptor(&paths, descriptor)?;
        tracing::debug!(name = %descriptor.name, "descriptor saved");
        Ok(())
    }

    /// Stop the VM if it runs, then remove its directory.
    pub async fn delete<R: CommandRunner>(
        &self,
        name: &str,
        supervisor: &ProcessSupervisor<R>,
        cancel: &CancellationToken,
    ) -> Result<(), VmError> {
        let paths = self.paths(name);
        if !paths.dir().is_dir() {
            return Err(VmError::NotFound { name: name.to_string() });
        }
        supervisor.stop(name, &paths, cancel).await?;
        self.remove_dir(name)?;
        tracing::info!(name, "deleted");
        Ok(())
    }

    /// Remove a VM directory without touching its process. Used to roll back
    /// a failed create.
    pub fn remove_dir(&self, name: &str) -> Result<(), VmError> {
        let paths = self.paths(name);
        match fs::remove_dir_all(paths.dir()) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(VmError::io(format!("removing {}", paths.dir().display()), e)),
        }
    }

    /// Every VM directory, sorted by name, each with its own load result so
    /// one bad descriptor does not hide the rest.
    pub fn list(&self) -> Result<Vec<(String, Result<VmDescriptor, VmError>)>, VmError> {
        let entries = match fs::read_dir(&self.vms_dir) {
            Ok(e) => e,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(VmError::io(format!("reading {}", self.vms_dir.display()), e)),
        };
        let mut names: Vec<String> = entries
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_ok_and(|t| t.is_dir()))
            .filter_map(|e| e.file_name().into_string().ok())
            .filter(|n| !n.starts_with('.'))
            .collect();
        names.sort();
        Ok(names
            .into_iter()
            .map(|name| {
                let loaded = self.load(&name);
                (name, loaded)
            })
            .collect())
    }
}

/// Write to a temp file and rename over the target.
fn write_descriptor(paths: &VmPaths, descriptor: &VmDescriptor) -> Result<(), VmError> {
    let target = paths.descriptor();
    let json = facet_json::to_string(descriptor).map_err(|e| VmError::Validation {
        message: format!("serializing descriptor: {e}"),
    })?;
    let tmp = target.with_extension("json.tmp");
    fs::write(&tmp, json + "\n").map_err(|e| VmError::io(format!("writing {}", tmp.display()), e))?;
    fs::rename(&tmp, &target).map_err(|e| VmError::io(format!("renaming to {}", target.display()), e))?;
    Ok(())
}
