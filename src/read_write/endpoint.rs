use crate::errors::*;
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::thread;
use std::time::Duration;

/// Abstract key-value backing store for chunks, hierarchy blocks and
/// manifests. Implementations must make `put` atomic: readers never see
/// a partially written object.
pub trait Endpoint: Send + Sync {
    fn get(&self, key: &str) -> Result<Vec<u8>>;
    fn put(&self, key: &str, data: &[u8]) -> Result<()>;
    fn exists(&self, key: &str) -> Result<bool>;
    /// All keys under 'prefix'. A prefix nothing was written under lists
    /// as empty.
    fn list(&self, prefix: &str) -> Result<Vec<String>>;

    fn copy(&self, src: &str, dst: &str) -> Result<()> {
        let data = self.get(src)?;
        self.put(dst, &data)
    }
}

const IO_ATTEMPTS: usize = 4;
const BACKOFF_BASE_MS: u64 = 50;

/// Retries transient endpoint failures with exponential backoff.
/// `EndpointNotFound` is a definite answer and is never retried.
pub fn retry_io<T, F>(mut operation: F) -> Result<T>
where
    F: FnMut() -> Result<T>,
{
    let mut attempt = 0;
    loop {
        match operation() {
            Ok(value) => return Ok(value),
            Err(e @ Error(ErrorKind::EndpointNotFound(_), _)) => return Err(e),
            Err(e) => {
                attempt += 1;
                if attempt >= IO_ATTEMPTS {
                    return Err(e);
                }
                thread::sleep(Duration::from_millis(BACKOFF_BASE_MS << attempt));
            }
        }
    }
}

/// Filesystem-backed endpoint rooted at a directory.
pub struct LocalEndpoint {
    root: PathBuf,
}

impl LocalEndpoint {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)
            .chain_err(|| format!("could not create output directory {:?}", root))?;
        Ok(LocalEndpoint { root })
    }

    fn resolve(&self, key: &str) -> PathBuf {
        self.root.join(key)
    }
}

impl Endpoint for LocalEndpoint {
    fn get(&self, key: &str) -> Result<Vec<u8>> {
        let path = self.resolve(key);
        let mut file = match File::open(&path) {
            Err(ref e) if e.kind() == std::io::ErrorKind::NotFound => {
                bail!(ErrorKind::EndpointNotFound(key.to_string()));
            }
            other => other.chain_err(|| ErrorKind::EndpointIo(key.to_string(), "open".into()))?,
        };
        let mut data = Vec::new();
        file.read_to_end(&mut data)
            .chain_err(|| ErrorKind::EndpointIo(key.to_string(), "read".into()))?;
        Ok(data)
    }

    fn put(&self, key: &str, data: &[u8]) -> Result<()> {
        let path = self.resolve(key);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .chain_err(|| ErrorKind::EndpointIo(key.to_string(), "mkdir".into()))?;
        }
        // Write to a sibling temp file and rename so readers never see a
        // half-written object.
        let tmp = temp_sibling(&path);
        {
            let mut file = File::create(&tmp)
                .chain_err(|| ErrorKind::EndpointIo(key.to_string(), "create".into()))?;
            file.write_all(data)
                .chain_err(|| ErrorKind::EndpointIo(key.to_string(), "write".into()))?;
        }
        fs::rename(&tmp, &path)
            .chain_err(|| ErrorKind::EndpointIo(key.to_string(), "rename".into()))?;
        Ok(())
    }

    fn exists(&self, key: &str) -> Result<bool> {
        Ok(self.resolve(key).exists())
    }

    fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let dir = self.resolve(prefix);
        if !dir.is_dir() {
            return Ok(Vec::new());
        }
        let mut keys = Vec::new();
        for entry in walkdir::WalkDir::new(&dir) {
            let entry =
                entry.chain_err(|| ErrorKind::EndpointIo(prefix.to_string(), "list".into()))?;
            if !entry.file_type().is_file() {
                continue;
            }
            let relative = entry
                .path()
                .strip_prefix(&self.root)
                .expect("walkdir stays under the endpoint root");
            keys.push(path_to_key(relative));
        }
        keys.sort();
        Ok(keys)
    }

    fn copy(&self, src: &str, dst: &str) -> Result<()> {
        let to = self.resolve(dst);
        if let Some(parent) = to.parent() {
            fs::create_dir_all(parent)
                .chain_err(|| ErrorKind::EndpointIo(dst.to_string(), "mkdir".into()))?;
        }
        match fs::copy(self.resolve(src), &to) {
            Ok(_) => Ok(()),
            Err(ref e) if e.kind() == std::io::ErrorKind::NotFound => {
                bail!(ErrorKind::EndpointNotFound(src.to_string()))
            }
            Err(e) => Err(e).chain_err(|| ErrorKind::EndpointIo(dst.to_string(), "copy".into())),
        }
    }
}

fn temp_sibling(path: &Path) -> PathBuf {
    let mut name = std::ffi::OsString::from(".");
    name.push(path.file_name().unwrap_or_else(|| std::ffi::OsStr::new("object")));
    name.push(".tmp");
    path.with_file_name(name)
}

fn path_to_key(path: &Path) -> String {
    let parts: Vec<String> = path
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect();
    parts.join("/")
}

/// An endpoint living entirely in memory. Useful for tests and as the
/// adapter pattern for object stores with a flat key namespace.
#[derive(Default)]
pub struct MemoryEndpoint {
    objects: Mutex<BTreeMap<String, Vec<u8>>>,
}

impl MemoryEndpoint {
    pub fn new() -> Self {
        MemoryEndpoint::default()
    }
}

impl Endpoint for MemoryEndpoint {
    fn get(&self, key: &str) -> Result<Vec<u8>> {
        match self.objects.lock().unwrap().get(key) {
            Some(data) => Ok(data.clone()),
            None => bail!(ErrorKind::EndpointNotFound(key.to_string())),
        }
    }

    fn put(&self, key: &str, data: &[u8]) -> Result<()> {
        self.objects
            .lock()
            .unwrap()
            .insert(key.to_string(), data.to_vec());
        Ok(())
    }

    fn exists(&self, key: &str) -> Result<bool> {
        Ok(self.objects.lock().unwrap().contains_key(key))
    }

    fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let objects = self.objects.lock().unwrap();
        let needle = if prefix.is_empty() || prefix.ends_with('/') {
            prefix.to_string()
        } else {
            format!("{}/", prefix)
        };
        Ok(objects
            .keys()
            .filter(|k| k.starts_with(&needle))
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempdir::TempDir;

    #[test]
    fn local_endpoint_round_trips() {
        let dir = TempDir::new("endpoint").unwrap();
        let endpoint = LocalEndpoint::new(dir.path()).unwrap();
        assert!(!endpoint.exists("a/b.bin").unwrap());
        endpoint.put("a/b.bin", b"payload").unwrap();
        assert!(endpoint.exists("a/b.bin").unwrap());
        assert_eq!(endpoint.get("a/b.bin").unwrap(), b"payload");

        match endpoint.get("missing") {
            Err(Error(ErrorKind::EndpointNotFound(key), _)) => assert_eq!(key, "missing"),
            other => panic!("expected EndpointNotFound, got {:?}", other),
        }
    }

    #[test]
    fn local_endpoint_lists_under_prefix() {
        let dir = TempDir::new("endpoint").unwrap();
        let endpoint = LocalEndpoint::new(dir.path()).unwrap();
        endpoint.put("data/1-0-0-0.bin", b"x").unwrap();
        endpoint.put("data/0-0-0-0.bin", b"y").unwrap();
        endpoint.put("other/0-0-0-0.bin", b"z").unwrap();
        assert_eq!(
            endpoint.list("data").unwrap(),
            vec!["data/0-0-0-0.bin".to_string(), "data/1-0-0-0.bin".to_string()]
        );
        assert!(endpoint.list("nothing").unwrap().is_empty());
    }

    #[test]
    fn local_endpoint_copies() {
        let dir = TempDir::new("endpoint").unwrap();
        let endpoint = LocalEndpoint::new(dir.path()).unwrap();
        endpoint.put("src.bin", b"chunk").unwrap();
        endpoint.copy("src.bin", "nested/dst.bin").unwrap();
        assert_eq!(endpoint.get("nested/dst.bin").unwrap(), b"chunk");
        assert!(endpoint.copy("missing.bin", "x").is_err());
    }

    #[test]
    fn memory_endpoint_round_trips() {
        let endpoint = MemoryEndpoint::new();
        endpoint.put("p/x", b"1").unwrap();
        endpoint.put("p/y", b"2").unwrap();
        endpoint.put("q/z", b"3").unwrap();
        assert_eq!(endpoint.list("p").unwrap(), vec!["p/x", "p/y"]);
        assert_eq!(endpoint.get("q/z").unwrap(), b"3");
        assert!(endpoint.get("q/w").is_err());
    }

    #[test]
    fn retry_io_gives_up_after_transient_failures() {
        let calls = AtomicUsize::new(0);
        let result: Result<()> = retry_io(|| {
            calls.fetch_add(1, Ordering::SeqCst);
            bail!(ErrorKind::EndpointIo("k".into(), "boom".into()));
        });
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn retry_io_does_not_retry_missing_objects() {
        let calls = AtomicUsize::new(0);
        let result: Result<Vec<u8>> = retry_io(|| {
            calls.fetch_add(1, Ordering::SeqCst);
            bail!(ErrorKind::EndpointNotFound("k".into()));
        });
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
