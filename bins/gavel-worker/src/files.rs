/// Test Data Cache - Content-Addressed Local Files
///
/// Test data is stored by hash and fetched from the run store on first use.
/// Files land under `cache_dir/<first two chars>/<hash>` through a temporary
/// file and a rename, so concurrent workers never observe partial files.
use crate::error::{JudgeError, JudgeResult};
use crate::metrics;
use crate::store::RunStore;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::fs;
use tracing::{debug, info};

pub struct FileStore {
    cache_dir: PathBuf,
    store: Arc<dyn RunStore>,
}

fn check_hash(hash: &str) -> JudgeResult<()> {
    if hash.len() < 2 || !hash.chars().all(|c| c.is_ascii_alphanumeric()) {
        return Err(JudgeError::Plan(format!("invalid file hash: {:?}", hash)));
    }
    Ok(())
}

impl FileStore {
    pub fn new(cache_dir: PathBuf, store: Arc<dyn RunStore>) -> Self {
        Self { cache_dir, store }
    }

    fn path_for(&self, hash: &str) -> PathBuf {
        self.cache_dir.join(&hash[..2]).join(hash)
    }

    /// Make every file in `hashes` available locally.
    pub async fn ensure(&self, hashes: &[String]) -> JudgeResult<HashMap<String, PathBuf>> {
        let mut paths = HashMap::new();
        let mut fetched = 0usize;
        for hash in hashes {
            if paths.contains_key(hash) {
                continue;
            }
            check_hash(hash)?;
            let path = self.path_for(hash);
            if fs::try_exists(&path).await? {
                metrics::record_cache_hit("files");
            } else {
                self.fetch(hash, &path).await?;
                fetched += 1;
            }
            paths.insert(hash.clone(), path);
        }
        if fetched > 0 {
            info!(fetched, total = paths.len(), "Test data cached");
        }
        Ok(paths)
    }

    async fn fetch(&self, hash: &str, path: &PathBuf) -> JudgeResult<()> {
        let contents = self
            .store
            .get_file(hash)
            .await?
            .ok_or_else(|| JudgeError::MissingFile(hash.to_string()))?;
        let Some(dir) = path.parent() else {
            return Err(JudgeError::Plan(format!("invalid file hash: {:?}", hash)));
        };
        fs::create_dir_all(dir).await?;
        let tmp = dir.join(format!(".{}.{}", hash, uuid::Uuid::new_v4()));
        fs::write(&tmp, &contents).await?;
        fs::rename(&tmp, path).await?;
        debug!(hash, bytes = contents.len(), "Fetched test data file");
        Ok(())
    }
}
