//! On-disk crawl state: the collection snapshot and the processed-link ledger.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use anyhow::Context;
use oph_core::LinkSet;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::debug;

pub const CRATE_NAME: &str = "oph-storage";

/// Checkpoint filename stem derived from the search query.
pub fn checkpoint_stem(query: &str) -> String {
    query.trim().replace(' ', "_")
}

/// Scroll-time persistence for discovered links. The file always holds a
/// full snapshot of the set: a present file means a resumable partial
/// collection, an absent file means collection never started or finished
/// cleanly.
#[derive(Debug, Clone)]
pub struct LinkSnapshot {
    path: PathBuf,
}

impl LinkSnapshot {
    pub fn for_query(dir: impl AsRef<Path>, query: &str) -> Self {
        Self {
            path: dir
                .as_ref()
                .join(format!("temp_links_{}.txt", checkpoint_stem(query))),
        }
    }

    pub fn from_path(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    /// Read the snapshot into a link set; an absent file yields an empty set.
    pub async fn load(&self) -> anyhow::Result<LinkSet> {
        let mut links = LinkSet::new();
        if !self.path.exists() {
            return Ok(links);
        }
        let text = fs::read_to_string(&self.path)
            .await
            .with_context(|| format!("reading snapshot {}", self.path.display()))?;
        links.merge(text.lines().map(str::trim).filter(|line| !line.is_empty()));
        Ok(links)
    }

    /// Atomically rewrite the snapshot with the full set, one link per line.
    pub async fn save(&self, links: &LinkSet) -> anyhow::Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)
                    .await
                    .with_context(|| format!("creating snapshot directory {}", parent.display()))?;
            }
        }

        let mut body = String::new();
        for link in links.iter() {
            body.push_str(link);
            body.push('\n');
        }

        // Single writer per run, so a fixed temp sibling is enough.
        let temp_path = self.path.with_extension("txt.tmp");
        fs::write(&temp_path, body.as_bytes())
            .await
            .with_context(|| format!("writing temp snapshot {}", temp_path.display()))?;
        fs::rename(&temp_path, &self.path)
            .await
            .with_context(|| {
                format!(
                    "renaming {} -> {}",
                    temp_path.display(),
                    self.path.display()
                )
            })?;
        debug!(path = %self.path.display(), links = links.len(), "snapshot saved");
        Ok(())
    }

    /// Delete the snapshot; called only after collection finished cleanly.
    pub async fn clear(&self) -> anyhow::Result<()> {
        match fs::remove_file(&self.path).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => {
                Err(err).with_context(|| format!("removing snapshot {}", self.path.display()))
            }
        }
    }
}

/// Append-only log of links whose detail extraction completed. Append is the
/// only mutation; a resumed run subtracts these from the pending set.
#[derive(Debug, Clone)]
pub struct ProcessedLedger {
    path: PathBuf,
}

impl ProcessedLedger {
    pub fn for_query(dir: impl AsRef<Path>, query: &str) -> Self {
        Self {
            path: dir
                .as_ref()
                .join(format!("processed_links_{}.txt", checkpoint_stem(query))),
        }
    }

    pub fn from_path(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    /// Append one link as its own line and flush before returning.
    pub async fn append(&self, link: &str) -> anyhow::Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)
                    .await
                    .with_context(|| format!("creating ledger directory {}", parent.display()))?;
            }
        }
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .with_context(|| format!("opening ledger {}", self.path.display()))?;
        file.write_all(format!("{link}\n").as_bytes())
            .await
            .with_context(|| format!("appending to ledger {}", self.path.display()))?;
        file.flush()
            .await
            .with_context(|| format!("flushing ledger {}", self.path.display()))?;
        Ok(())
    }

    /// Read all processed links into a set; an absent file yields empty.
    pub async fn load(&self) -> anyhow::Result<HashSet<String>> {
        if !self.path.exists() {
            return Ok(HashSet::new());
        }
        let text = fs::read_to_string(&self.path)
            .await
            .with_context(|| format!("reading ledger {}", self.path.display()))?;
        Ok(text
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(str::to_string)
            .collect())
    }
}
