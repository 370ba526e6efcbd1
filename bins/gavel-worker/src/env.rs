/// Execution Environment - Hard-Linked Stream Files
///
/// Each program gets a private directory with a `read/` side, mounted read
/// only, and a `write/` side the program may write to. Streams are linked in
/// under fixed names before an invocation and removed right after it, so a
/// program never sees files from a previous test case.
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use tokio::fs;

pub const INPUT: &str = "input";
pub const OUTPUT: &str = "output";
pub const ERROR: &str = "error";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Read,
    Write,
}

#[derive(Debug)]
pub struct Environment {
    read_dir: PathBuf,
    write_dir: PathBuf,
}

impl Environment {
    pub async fn create(root: &Path) -> std::io::Result<Self> {
        let read_dir = root.join("read");
        let write_dir = root.join("write");
        fs::create_dir_all(&read_dir).await?;
        fs::create_dir_all(&write_dir).await?;
        Ok(Self { read_dir, write_dir })
    }

    pub fn read_dir(&self) -> &Path {
        &self.read_dir
    }

    pub fn write_dir(&self) -> &Path {
        &self.write_dir
    }

    pub fn path_for(&self, side: Side, name: &str) -> PathBuf {
        match side {
            Side::Read => self.read_dir.join(name),
            Side::Write => self.write_dir.join(name),
        }
    }

    /// Hard-link `source` into the environment under `name`.
    pub async fn link(&self, source: &Path, side: Side, name: &str) -> std::io::Result<PathBuf> {
        let target = self.path_for(side, name);
        fs::hard_link(source, &target).await?;
        Ok(target)
    }

    /// Remove everything linked into either side.
    pub async fn clear(&self) -> std::io::Result<()> {
        for dir in [&self.read_dir, &self.write_dir] {
            let mut entries = fs::read_dir(dir).await?;
            while let Some(entry) = entries.next_entry().await? {
                let path = entry.path();
                if entry.file_type().await?.is_dir() {
                    fs::remove_dir_all(&path).await?;
                } else {
                    fs::remove_file(&path).await?;
                }
            }
        }
        Ok(())
    }

    /// Restore owner access on everything under `write/`, since a sandboxed
    /// program may have stripped permissions from what it created.
    pub async fn reset_permissions(&self) -> std::io::Result<()> {
        let mut pending = vec![self.write_dir.clone()];
        while let Some(dir) = pending.pop() {
            fs::set_permissions(&dir, std::fs::Permissions::from_mode(0o777)).await?;
            let mut entries = fs::read_dir(&dir).await?;
            while let Some(entry) = entries.next_entry().await? {
                let path = entry.path();
                if entry.file_type().await?.is_dir() {
                    pending.push(path);
                } else {
                    fs::set_permissions(&path, std::fs::Permissions::from_mode(0o666)).await?;
                }
            }
        }
        Ok(())
    }
}
