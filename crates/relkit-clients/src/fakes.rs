//! In-memory fakes for the collaborator traits (testing only)
//!
//! Provides `MemoryObjectStore`, `FakeRegistry`, `FakeImageMirror`,
//! `FakeChartTool`, `FakeSourceControl` and `FakeSigner`. Each records the
//! calls it receives so tests can assert on what the pipeline did.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;

use crate::error::{ClientError, ClientResult};
use crate::traits::*;

// ---------------------------------------------------------------------------
// MemoryObjectStore
// ---------------------------------------------------------------------------

/// Object store backed by a `HashMap<(bucket, key), bytes>`.
///
/// `hide_for(bucket, key, n)` makes the next `n` existence probes for that key
/// report `false`, emulating eventual consistency.
#[derive(Debug, Default)]
pub struct MemoryObjectStore {
    objects: Mutex<HashMap<(String, String), Vec<u8>>>,
    hidden: Mutex<HashMap<(String, String), u32>>,
    probes: Mutex<Vec<(String, String)>>,
    uploads: Mutex<Vec<(String, String)>>,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&self, bucket: &str, key: &str, data: impl Into<Vec<u8>>) {
        self.objects
            .lock()
            .unwrap()
            .insert((bucket.to_string(), key.to_string()), data.into());
    }

    pub fn get(&self, bucket: &str, key: &str) -> Option<Vec<u8>> {
        self.objects
            .lock()
            .unwrap()
            .get(&(bucket.to_string(), key.to_string()))
            .cloned()
    }

    pub fn hide_for(&self, bucket: &str, key: &str, probes: u32) {
        self.hidden
            .lock()
            .unwrap()
            .insert((bucket.to_string(), key.to_string()), probes);
    }

    /// Keys uploaded to `bucket`, sorted.
    pub fn uploaded_keys(&self, bucket: &str) -> Vec<String> {
        let mut keys: Vec<String> = self
            .uploads
            .lock()
            .unwrap()
            .iter()
            .filter(|(b, _)| b == bucket)
            .map(|(_, k)| k.clone())
            .collect();
        keys.sort();
        keys
    }

    pub fn probe_count(&self, bucket: &str, key: &str) -> usize {
        self.probes
            .lock()
            .unwrap()
            .iter()
            .filter(|(b, k)| b == bucket && k == key)
            .count()
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn key_exists(&self, bucket: &str, key: &str) -> ClientResult<bool> {
        let id = (bucket.to_string(), key.to_string());
        self.probes.lock().unwrap().push(id.clone());
        {
            let mut hidden = self.hidden.lock().unwrap();
            if let Some(remaining) = hidden.get_mut(&id) {
                if *remaining > 0 {
                    *remaining -= 1;
                    return Ok(false);
                }
            }
        }
        Ok(self.objects.lock().unwrap().contains_key(&id))
    }

    async fn download_file(&self, path: &Path, bucket: &str, key: &str) -> ClientResult<()> {
        let data = self.get(bucket, key).ok_or_else(|| ClientError::ObjectNotFound {
            bucket: bucket.to_string(),
            key: key.to_string(),
        })?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, data)?;
        Ok(())
    }

    async fn upload_file(&self, path: &Path, bucket: &str, key: &str) -> ClientResult<()> {
        let data = std::fs::read(path)?;
        self.put(bucket, key, data);
        self.uploads
            .lock()
            .unwrap()
            .push((bucket.to_string(), key.to_string()));
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// FakeRegistry
// ---------------------------------------------------------------------------

/// Registry that answers digest lookups from a preset map.
#[derive(Debug, Default)]
pub struct FakeRegistry {
    digests: Mutex<HashMap<String, String>>,
    lookups: Mutex<Vec<String>>,
}

impl FakeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_digest(self, image_uri: &str, digest: &str) -> Self {
        self.set_digest(image_uri, digest);
        self
    }

    pub fn set_digest(&self, image_uri: &str, digest: &str) {
        self.digests
            .lock()
            .unwrap()
            .insert(image_uri.to_string(), digest.to_string());
    }

    pub fn lookups(&self) -> Vec<String> {
        self.lookups.lock().unwrap().clone()
    }
}

#[async_trait]
impl ContainerRegistry for FakeRegistry {
    async fn image_digest(&self, image_uri: &str) -> ClientResult<String> {
        self.lookups.lock().unwrap().push(image_uri.to_string());
        self.digests
            .lock()
            .unwrap()
            .get(image_uri)
            .cloned()
            .ok_or_else(|| ClientError::ImageNotFound {
                uri: image_uri.to_string(),
            })
    }
}

// ---------------------------------------------------------------------------
// FakeImageMirror
// ---------------------------------------------------------------------------

/// Records copies; `fail_next(n)` makes the next `n` copies fail transiently.
#[derive(Debug, Default)]
pub struct FakeImageMirror {
    copies: Mutex<Vec<(String, String)>>,
    failures_left: Mutex<u32>,
    attempts: Mutex<u32>,
}

impl FakeImageMirror {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_next(&self, n: u32) {
        *self.failures_left.lock().unwrap() = n;
    }

    pub fn copies(&self) -> Vec<(String, String)> {
        let mut copies = self.copies.lock().unwrap().clone();
        copies.sort();
        copies
    }

    pub fn attempts(&self) -> u32 {
        *self.attempts.lock().unwrap()
    }
}

#[async_trait]
impl ImageMirror for FakeImageMirror {
    async fn copy_image(&self, source_uri: &str, dest_uri: &str) -> ClientResult<()> {
        *self.attempts.lock().unwrap() += 1;
        {
            let mut left = self.failures_left.lock().unwrap();
            if *left > 0 {
                *left -= 1;
                return Err(ClientError::CommandFailed {
                    command: "skopeo copy".to_string(),
                    detail: "connection reset by peer".to_string(),
                });
            }
        }
        self.copies
            .lock()
            .unwrap()
            .push((source_uri.to_string(), dest_uri.to_string()));
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// FakeChartTool
// ---------------------------------------------------------------------------

/// Chart tool that "pulls" a chart by writing preset files into the work dir.
///
/// `package` snapshots the preset files as they are at packaging time, and
/// `fail_next_push(n)` makes the next `n` pushes fail transiently.
#[derive(Debug, Default)]
pub struct FakeChartTool {
    files: Mutex<Vec<(String, String)>>,
    pulls: Mutex<Vec<(String, String)>>,
    pushes: Mutex<Vec<(PathBuf, String)>>,
    packaged: Mutex<Vec<BTreeMap<String, String>>>,
    push_failures_left: Mutex<u32>,
    push_attempts: Mutex<u32>,
}

impl FakeChartTool {
    pub fn new() -> Self {
        Self::default()
    }

    /// File written into every pulled chart, relative to the chart root.
    pub fn with_file(self, name: &str, contents: &str) -> Self {
        self.files
            .lock()
            .unwrap()
            .push((name.to_string(), contents.to_string()));
        self
    }

    pub fn pulls(&self) -> Vec<(String, String)> {
        self.pulls.lock().unwrap().clone()
    }

    pub fn pushes(&self) -> Vec<(PathBuf, String)> {
        self.pushes.lock().unwrap().clone()
    }

    /// Contents of the preset files in each packaged chart, keyed by file name.
    pub fn packaged_files(&self) -> Vec<BTreeMap<String, String>> {
        self.packaged.lock().unwrap().clone()
    }

    pub fn fail_next_push(&self, n: u32) {
        *self.push_failures_left.lock().unwrap() = n;
    }

    pub fn push_attempts(&self) -> u32 {
        *self.push_attempts.lock().unwrap()
    }
}

#[async_trait]
impl ChartTool for FakeChartTool {
    async fn pull(&self, chart_ref: &str, version: &str, work_dir: &Path) -> ClientResult<PathBuf> {
        self.pulls
            .lock()
            .unwrap()
            .push((chart_ref.to_string(), version.to_string()));
        let name = chart_ref
            .rsplit('/')
            .next()
            .unwrap_or(chart_ref)
            .split(':')
            .next()
            .unwrap_or(chart_ref);
        let dir = work_dir.join(name);
        std::fs::create_dir_all(&dir)?;
        for (file, contents) in self.files.lock().unwrap().iter() {
            std::fs::write(dir.join(file), contents)?;
        }
        Ok(dir)
    }

    async fn package(&self, chart_dir: &Path, out_dir: &Path) -> ClientResult<PathBuf> {
        let names: Vec<String> = self
            .files
            .lock()
            .unwrap()
            .iter()
            .map(|(name, _)| name.clone())
            .collect();
        let mut snapshot = BTreeMap::new();
        for name in names {
            snapshot.insert(name.clone(), std::fs::read_to_string(chart_dir.join(&name))?);
        }
        self.packaged.lock().unwrap().push(snapshot);
        let name = chart_dir
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "chart".to_string());
        let package = out_dir.join(format!("{name}.tgz"));
        std::fs::write(&package, b"packaged")?;
        Ok(package)
    }

    async fn push(&self, package: &Path, remote: &str) -> ClientResult<()> {
        *self.push_attempts.lock().unwrap() += 1;
        {
            let mut left = self.push_failures_left.lock().unwrap();
            if *left > 0 {
                *left -= 1;
                return Err(ClientError::CommandFailed {
                    command: "helm push".to_string(),
                    detail: "i/o timeout".to_string(),
                });
            }
        }
        self.pushes
            .lock()
            .unwrap()
            .push((package.to_path_buf(), remote.to_string()));
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// FakeSourceControl
// ---------------------------------------------------------------------------

/// Source control over a plain directory: checkout only records the branch.
#[derive(Debug)]
pub struct FakeSourceControl {
    current_branch: Mutex<String>,
    describe: Mutex<HashMap<PathBuf, String>>,
    checkouts: Mutex<Vec<String>>,
    head: String,
}

impl FakeSourceControl {
    pub fn new(current_branch: &str) -> Self {
        Self {
            current_branch: Mutex::new(current_branch.to_string()),
            describe: Mutex::new(HashMap::new()),
            checkouts: Mutex::new(Vec::new()),
            head: "0123456789abcdef0123456789abcdef01234567".to_string(),
        }
    }

    pub fn with_describe(self, repo: &Path, output: &str) -> Self {
        self.describe
            .lock()
            .unwrap()
            .insert(repo.to_path_buf(), output.to_string());
        self
    }

    pub fn checkouts(&self) -> Vec<String> {
        self.checkouts.lock().unwrap().clone()
    }
}

#[async_trait]
impl SourceControl for FakeSourceControl {
    async fn checkout(&self, _repo: &Path, branch: &str) -> ClientResult<()> {
        self.checkouts.lock().unwrap().push(branch.to_string());
        *self.current_branch.lock().unwrap() = branch.to_string();
        Ok(())
    }

    async fn describe_tag(&self, repo: &Path) -> ClientResult<String> {
        self.describe
            .lock()
            .unwrap()
            .get(repo)
            .cloned()
            .ok_or_else(|| ClientError::CommandFailed {
                command: "git describe --tag".to_string(),
                detail: format!("no tags in {}", repo.display()),
            })
    }

    async fn head(&self, _repo: &Path) -> ClientResult<String> {
        Ok(self.head.clone())
    }

    async fn current_branch(&self, _repo: &Path) -> ClientResult<String> {
        Ok(self.current_branch.lock().unwrap().clone())
    }
}

// ---------------------------------------------------------------------------
// FakeSigner
// ---------------------------------------------------------------------------

/// Signer whose "signature" is the digest itself prefixed by the key id.
#[derive(Debug, Default)]
pub struct FakeSigner {
    requests: Mutex<Vec<(String, [u8; 32])>>,
}

impl FakeSigner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn requests(&self) -> Vec<(String, [u8; 32])> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl Signer for FakeSigner {
    async fn sign_digest(&self, digest: &[u8; 32], key_id: &str) -> ClientResult<Vec<u8>> {
        self.requests
            .lock()
            .unwrap()
            .push((key_id.to_string(), *digest));
        let mut sig = key_id.as_bytes().to_vec();
        sig.extend_from_slice(digest);
        Ok(sig)
    }
}
