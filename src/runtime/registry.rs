//! Host-owned registry of running processes and their persisted state.
//!
//! A [`ProcessRegistry`] maps identities to processes so the host can refuse a
//! second process for an identity that is still running and can clear an
//! identity's stored data once nothing uses it.

use crate::runtime::config::{validate_identity, ProcessConfig};
use crate::runtime::context::Context;
use crate::runtime::error::BridgeError;
use crate::runtime::events::EventListener;
use crate::runtime::process::Process;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};

/// How much persisted state `uninstall` removes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UninstallScope {
    /// Only state private to this host.
    Local,
    /// Private state plus state shared with other hosts.
    Global,
}

/// Storage that keeps per-identity data between process runs.
pub trait PersistentStore: Send + Sync {
    fn uninstall(&self, identity: &str, scope: UninstallScope) -> Result<(), BridgeError>;
}

/// Directory-per-identity store on the local filesystem.
#[derive(Debug, Clone)]
pub struct FsStore {
    private_root: PathBuf,
    public_root: PathBuf,
}

impl FsStore {
    pub fn new(private_root: impl Into<PathBuf>, public_root: impl Into<PathBuf>) -> Self {
        Self {
            private_root: private_root.into(),
            public_root: public_root.into(),
        }
    }

    /// Private data directory of `identity`.
    pub fn data_dir(&self, identity: &str) -> Result<PathBuf, BridgeError> {
        validate_identity(identity)?;
        Ok(self.private_root.join(identity))
    }

    /// Shared data directory of `identity`.
    pub fn public_dir(&self, identity: &str) -> Result<PathBuf, BridgeError> {
        validate_identity(identity)?;
        Ok(self.public_root.join(identity))
    }
}

fn remove_tree(path: &Path) -> Result<(), BridgeError> {
    match fs::remove_dir_all(path) {
        Ok(()) => {
            tracing::debug!(path = %path.display(), "removed persisted state");
            Ok(())
        }
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err.into()),
    }
}

impl PersistentStore for FsStore {
    fn uninstall(&self, identity: &str, scope: UninstallScope) -> Result<(), BridgeError> {
        remove_tree(&self.data_dir(identity)?)?;
        if scope == UninstallScope::Global {
            remove_tree(&self.public_dir(identity)?)?;
        }
        Ok(())
    }
}

type ProcessMap = Mutex<HashMap<String, Process>>;

/// Drops a registry entry once its process is finished.
struct Deregister {
    processes: Weak<ProcessMap>,
}

impl Deregister {
    fn remove(&self, process: &Process) {
        let Some(processes) = self.processes.upgrade() else {
            return;
        };
        let mut processes = processes.lock();
        if processes.get(process.identity()) == Some(process) {
            processes.remove(process.identity());
        }
    }
}

impl EventListener for Deregister {
    fn on_process_start(&self, _process: &Process, _context: &Context) {}

    fn on_process_about_to_exit(&self, _process: &Process, _exit_code: i32) {}

    fn on_process_exit(&self, process: &Process, _exit_code: i32) {
        self.remove(process);
    }

    fn on_process_failed(&self, process: &Process, _error: &BridgeError) {
        self.remove(process);
    }
}

/// Processes by identity, owned by the embedding application.
///
/// The registry keeps non-owning views; the handle returned by
/// [`spawn`](Self::spawn) is what keeps a process alive.
pub struct ProcessRegistry {
    store: Arc<dyn PersistentStore>,
    processes: Arc<ProcessMap>,
}

impl ProcessRegistry {
    pub fn new(store: Arc<dyn PersistentStore>) -> Self {
        Self {
            store,
            processes: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Start a process unless one with the same identity is still running.
    pub fn spawn(
        &self,
        config: ProcessConfig,
        listener: Option<Arc<dyn EventListener>>,
    ) -> Result<Process, BridgeError> {
        validate_identity(&config.identity)?;
        let mut processes = self.processes.lock();
        if let Some(existing) = processes.get(&config.identity) {
            if !existing.is_done() {
                return Err(BridgeError::IdentityInUse(config.identity));
            }
        }

        let identity = config.identity.clone();
        let deregister: Arc<dyn EventListener> = Arc::new(Deregister {
            processes: Arc::downgrade(&self.processes),
        });
        let listeners = listener.into_iter().chain(Some(deregister)).collect();
        let process = Process::with_listeners(config, listeners)?;
        processes.insert(identity, Process::view(process.shared().clone()));
        Ok(process)
    }

    pub fn get(&self, identity: &str) -> Option<Process> {
        self.processes.lock().get(identity).cloned()
    }

    /// Identities with a registered process, sorted.
    pub fn identities(&self) -> Vec<String> {
        let mut identities: Vec<String> = self.processes.lock().keys().cloned().collect();
        identities.sort();
        identities
    }

    /// Remove the persisted state of `identity`. Refused while its process runs.
    pub fn uninstall(&self, identity: &str, scope: UninstallScope) -> Result<(), BridgeError> {
        validate_identity(identity)?;
        let processes = self.processes.lock();
        if let Some(process) = processes.get(identity) {
            if !process.is_done() {
                return Err(BridgeError::IdentityInUse(identity.to_string()));
            }
        }
        tracing::info!(identity, ?scope, "uninstalling");
        self.store.uninstall(identity, scope)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn store() -> (TempDir, FsStore) {
        let dir = TempDir::new().unwrap();
        let store = FsStore::new(dir.path().join("private"), dir.path().join("public"));
        (dir, store)
    }

    fn seed(path: &Path) {
        fs::create_dir_all(path).unwrap();
        fs::write(path.join("state.json"), b"{}").unwrap();
    }

    #[test]
    fn test_local_uninstall_keeps_public_state() {
        let (_dir, store) = store();
        let private = store.data_dir("_1").unwrap();
        let public = store.public_dir("_1").unwrap();
        seed(&private);
        seed(&public);

        store.uninstall("_1", UninstallScope::Local).unwrap();
        assert!(!private.exists());
        assert!(public.exists());
    }

    #[test]
    fn test_global_uninstall_removes_everything() {
        let (_dir, store) = store();
        let private = store.data_dir("_1").unwrap();
        let public = store.public_dir("_1").unwrap();
        seed(&private);
        seed(&public);
        seed(&store.data_dir("_2").unwrap());

        store.uninstall("_1", UninstallScope::Global).unwrap();
        assert!(!private.exists());
        assert!(!public.exists());
        assert!(store.data_dir("_2").unwrap().exists());
    }

    #[test]
    fn test_uninstall_of_unknown_identity_is_ok() {
        let (_dir, store) = store();
        store.uninstall("never-installed", UninstallScope::Global).unwrap();
    }

    #[test]
    fn test_path_like_identities_are_rejected() {
        let (_dir, store) = store();
        assert!(matches!(
            store.uninstall("../escape", UninstallScope::Local),
            Err(BridgeError::InvalidIdentity(_))
        ));
        assert!(store.data_dir("a/b").is_err());
    }

    #[test]
    fn test_registry_uninstall_without_processes() {
        let (dir, store) = store();
        let private = store.data_dir("idle").unwrap();
        seed(&private);

        let registry = ProcessRegistry::new(Arc::new(store));
        assert!(registry.identities().is_empty());
        assert!(registry.get("idle").is_none());
        registry.uninstall("idle", UninstallScope::Local).unwrap();
        assert!(!private.exists());
        drop(dir);
    }
}
