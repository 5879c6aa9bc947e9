//! Directory-backed object store.
//!
//! Layout: `<root>/<container>/<name>.obj` holds the body and
//! `<name>.lock` the active lock record. Every operation runs under an
//! exclusive `flock` on `<container>/.guard`, so processes sharing the root
//! see each conditional check and its write as one step.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;

use super::lock::{self, LockRecord};
use super::{ObjectKey, ObjectStore, StoreError, StoreResult, StoredObject};

const GUARD_FILE: &str = ".guard";

#[derive(Clone, Debug)]
pub struct FsStore {
    root: PathBuf,
}

impl FsStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn container_dir(&self, container: &str) -> StoreResult<PathBuf> {
        validate_name(container)?;
        Ok(self.root.join(container))
    }

    async fn blocking<T, F>(f: F) -> StoreResult<T>
    where
        T: Send + 'static,
        F: FnOnce() -> StoreResult<T> + Send + 'static,
    {
        tokio::task::spawn_blocking(f)
            .await
            .map_err(|err| StoreError::Backend(format!("blocking store task failed: {err}")))?
    }

    /// Runs `f` under the container guard.
    async fn guarded<T, F>(&self, key: &ObjectKey, must_exist: bool, f: F) -> StoreResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&ObjectFiles, u64) -> StoreResult<T> + Send + 'static,
    {
        let dir = self.container_dir(&key.container)?;
        validate_name(&key.name)?;
        let key = key.clone();
        Self::blocking(move || {
            if !dir.is_dir() {
                return Err(StoreError::ContainerNotFound(key.container.clone()));
            }
            let _guard = ContainerGuard::acquire(&dir)?;
            let files = ObjectFiles::new(&dir, key);
            if must_exist && !files.exists() {
                return Err(StoreError::NotFound(files.key.clone()));
            }
            f(&files, now_ms())
        })
        .await
    }
}

struct ContainerGuard {
    _file: File,
}

impl ContainerGuard {
    fn acquire(dir: &Path) -> StoreResult<Self> {
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(dir.join(GUARD_FILE))?;
        loop {
            let res = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX) };
            if res == 0 {
                break;
            }
            let err = std::io::Error::last_os_error();
            if err.kind() != std::io::ErrorKind::Interrupted {
                return Err(StoreError::Io(err));
            }
        }
        // closing the descriptor drops the flock
        Ok(Self { _file: file })
    }
}

struct ObjectFiles {
    key: ObjectKey,
    body: PathBuf,
    lock: PathBuf,
}

impl ObjectFiles {
    fn new(dir: &Path, key: ObjectKey) -> Self {
        let body = dir.join(format!("{}.obj", key.name));
        let lock = dir.join(format!("{}.lock", key.name));
        Self { key, body, lock }
    }

    fn exists(&self) -> bool {
        self.body.is_file()
    }

    fn read_body(&self) -> StoreResult<Vec<u8>> {
        match std::fs::read(&self.body) {
            Ok(body) => Ok(body),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                Err(StoreError::NotFound(self.key.clone()))
            }
            Err(err) => Err(err.into()),
        }
    }

    fn write_body(&self, body: &[u8]) -> StoreResult<()> {
        write_atomic(&self.body, body)
    }

    fn read_lock(&self) -> StoreResult<Option<LockRecord>> {
        let data = match std::fs::read(&self.lock) {
            Ok(data) => data,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        serde_json::from_slice(&data)
            .map(Some)
            .map_err(|err| StoreError::Backend(format!("corrupt lock record {}: {err}", self.key)))
    }

    fn write_lock(&self, slot: &Option<LockRecord>) -> StoreResult<()> {
        match slot {
            Some(record) => {
                let data = serde_json::to_vec(record)
                    .map_err(|err| StoreError::Backend(format!("lock record encode: {err}")))?;
                write_atomic(&self.lock, &data)
            }
            None => remove_if_present(&self.lock),
        }
    }

    fn update_lock(
        &self,
        f: impl FnOnce(&mut Option<LockRecord>) -> StoreResult<()>,
    ) -> StoreResult<()> {
        let mut slot = self.read_lock()?;
        f(&mut slot)?;
        self.write_lock(&slot)
    }
}

#[async_trait]
impl ObjectStore for FsStore {
    async fn container_exists(&self, container: &str) -> StoreResult<bool> {
        let dir = self.container_dir(container)?;
        Self::blocking(move || Ok(dir.is_dir())).await
    }

    async fn create_container(&self, container: &str) -> StoreResult<()> {
        let dir = self.container_dir(container)?;
        Self::blocking(move || Ok(std::fs::create_dir_all(dir)?)).await
    }

    async fn delete_container(&self, container: &str) -> StoreResult<()> {
        let dir = self.container_dir(container)?;
        let name = container.to_string();
        Self::blocking(move || match std::fs::remove_dir_all(&dir) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                Err(StoreError::ContainerNotFound(name))
            }
            Err(err) => Err(err.into()),
        })
        .await
    }

    async fn get(&self, key: &ObjectKey) -> StoreResult<StoredObject> {
        self.guarded(key, true, |files, now_ms| {
            let body = files.read_body()?;
            let slot = files.read_lock()?;
            Ok(StoredObject {
                body,
                lock_state: lock::lock_state(&slot, now_ms),
            })
        })
        .await
    }

    async fn create_if_absent(&self, key: &ObjectKey, body: Vec<u8>) -> StoreResult<()> {
        self.guarded(key, false, move |files, _| {
            if files.exists() {
                return Err(StoreError::AlreadyExists(files.key.clone()));
            }
            // a lock left behind by a deleted object must not carry over
            remove_if_present(&files.lock)?;
            files.write_body(&body)
        })
        .await
    }

    async fn overwrite(&self, key: &ObjectKey, body: Vec<u8>, lock_token: &str) -> StoreResult<()> {
        let token = lock_token.to_string();
        self.guarded(key, true, move |files, now_ms| {
            let slot = files.read_lock()?;
            lock::check_write(&slot, &files.key, &token, now_ms)?;
            files.write_body(&body)
        })
        .await
    }

    async fn acquire_lock(
        &self,
        key: &ObjectKey,
        token: &str,
        duration: Duration,
    ) -> StoreResult<()> {
        let token = token.to_string();
        self.guarded(key, true, move |files, now_ms| {
            files.update_lock(|slot| lock::acquire(slot, &files.key, &token, duration, now_ms))
        })
        .await
    }

    async fn break_lock(
        &self,
        key: &ObjectKey,
        current_token: &str,
        new_token: &str,
    ) -> StoreResult<()> {
        let current = current_token.to_string();
        let new = new_token.to_string();
        self.guarded(key, true, move |files, now_ms| {
            files.update_lock(|slot| lock::change(slot, &files.key, &current, &new, now_ms))
        })
        .await
    }

    async fn renew_lock(&self, key: &ObjectKey, token: &str) -> StoreResult<()> {
        let token = token.to_string();
        self.guarded(key, true, move |files, now_ms| {
            files.update_lock(|slot| lock::renew(slot, &files.key, &token, now_ms))
        })
        .await
    }

    async fn release_lock(&self, key: &ObjectKey, token: &str) -> StoreResult<()> {
        let token = token.to_string();
        self.guarded(key, true, move |files, now_ms| {
            files.update_lock(|slot| lock::release(slot, &files.key, &token, now_ms))
        })
        .await
    }

    async fn delete(&self, key: &ObjectKey) -> StoreResult<()> {
        self.guarded(key, true, |files, now_ms| {
            let slot = files.read_lock()?;
            lock::check_delete(&slot, &files.key, now_ms)?;
            remove_if_present(&files.body)?;
            remove_if_present(&files.lock)
        })
        .await
    }
}

fn validate_name(name: &str) -> StoreResult<()> {
    if name.is_empty()
        || name.starts_with('.')
        || name.contains('/')
        || name.contains('\\')
        || name.contains('\0')
    {
        return Err(StoreError::InvalidKey(name.to_string()));
    }
    Ok(())
}

fn write_atomic(path: &Path, data: &[u8]) -> StoreResult<()> {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    let mut file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(&tmp)?;
    file.write_all(data)?;
    file.sync_all()?;
    std::fs::rename(tmp, path)?;
    Ok(())
}

fn remove_if_present(path: &Path) -> StoreResult<()> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err.into()),
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
