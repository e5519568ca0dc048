use std::path::PathBuf;

use anyhow::Context;
use sha2::{Digest, Sha256};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

/// One raw listing page kept for a crawl.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredSnapshot {
    pub run_id: Uuid,
    pub page: usize,
    pub path: PathBuf,
    pub sha256: String,
    pub byte_size: u64,
    /// The same bytes were already on disk and were not rewritten.
    pub reused: bool,
}

/// Raw listing pages laid out as `<root>/<run_id>/page-NNN.html`, so a
/// crawl's snapshot list can be re-read after the fact.
#[derive(Debug, Clone)]
pub struct SnapshotStore {
    root: PathBuf,
}

fn page_file_name(page: usize) -> String {
    format!("page-{page:03}.html")
}

fn page_number(file_name: &str) -> Option<usize> {
    file_name
        .strip_prefix("page-")?
        .strip_suffix(".html")?
        .parse()
        .ok()
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

impl SnapshotStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn run_dir(&self, run_id: Uuid) -> PathBuf {
        self.root.join(run_id.to_string())
    }

    /// Writes page `page` of crawl `run_id` through a temp file and an atomic
    /// rename. Rewriting a page with identical bytes leaves the file alone.
    pub async fn store_page(
        &self,
        run_id: Uuid,
        page: usize,
        body: &[u8],
    ) -> anyhow::Result<StoredSnapshot> {
        let dir = self.run_dir(run_id);
        let path = dir.join(page_file_name(page));
        let sha256 = sha256_hex(body);
        let snapshot = |reused| StoredSnapshot {
            run_id,
            page,
            path: path.clone(),
            sha256: sha256.clone(),
            byte_size: body.len() as u64,
            reused,
        };

        fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("creating snapshot directory {}", dir.display()))?;

        match fs::read(&path).await {
            Ok(existing) if sha256_hex(&existing) == sha256 => return Ok(snapshot(true)),
            Ok(_) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => {
                return Err(err).with_context(|| format!("reading snapshot {}", path.display()))
            }
        }

        let temp_path = dir.join(format!(".{}.tmp", Uuid::new_v4()));
        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .with_context(|| format!("opening temp snapshot {}", temp_path.display()))?;
        file.write_all(body)
            .await
            .with_context(|| format!("writing temp snapshot {}", temp_path.display()))?;
        file.flush()
            .await
            .with_context(|| format!("flushing temp snapshot {}", temp_path.display()))?;
        drop(file);

        if let Err(err) = fs::rename(&temp_path, &path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(err).with_context(|| {
                format!("renaming {} -> {}", temp_path.display(), path.display())
            });
        }
        Ok(snapshot(false))
    }

    /// Pages kept for `run_id`, in page order. An unknown run has none.
    pub async fn pages_for_run(&self, run_id: Uuid) -> anyhow::Result<Vec<StoredSnapshot>> {
        let dir = self.run_dir(run_id);
        let mut entries = match fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => {
                return Err(err).with_context(|| format!("listing snapshots in {}", dir.display()))
            }
        };

        let mut pages = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .with_context(|| format!("listing snapshots in {}", dir.display()))?
        {
            let Some(page) = entry.file_name().to_str().and_then(page_number) else {
                continue;
            };
            let path = entry.path();
            let body = fs::read(&path)
                .await
                .with_context(|| format!("reading snapshot {}", path.display()))?;
            pages.push(StoredSnapshot {
                run_id,
                page,
                sha256: sha256_hex(&body),
                byte_size: body.len() as u64,
                path,
                reused: false,
            });
        }
        pages.sort_by_key(|s| s.page);
        Ok(pages)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn hashing_is_stable() {
        assert_eq!(
            sha256_hex(b"hello world"),
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[test]
    fn only_page_files_are_recognised() {
        assert_eq!(page_number("page-007.html"), Some(7));
        assert_eq!(page_number("page-120.html"), Some(120));
        assert_eq!(page_number(".3f1c.tmp"), None);
        assert_eq!(page_number("page-x.html"), None);
    }

    #[tokio::test]
    async fn pages_are_listed_per_run_in_page_order() {
        let dir = tempdir().expect("tempdir");
        let store = SnapshotStore::new(dir.path());
        let run = Uuid::new_v4();
        let other = Uuid::new_v4();

        store.store_page(run, 2, b"<html>two</html>").await.expect("page 2");
        store.store_page(run, 1, b"<html>one</html>").await.expect("page 1");
        store.store_page(other, 1, b"<html>elsewhere</html>").await.expect("other run");

        let pages = store.pages_for_run(run).await.expect("list");
        assert_eq!(pages.iter().map(|p| p.page).collect::<Vec<_>>(), vec![1, 2]);
        assert_eq!(pages[0].sha256, sha256_hex(b"<html>one</html>"));
        assert_eq!(pages[0].path, dir.path().join(run.to_string()).join("page-001.html"));
        assert!(store.pages_for_run(Uuid::new_v4()).await.expect("unknown").is_empty());
    }

    #[tokio::test]
    async fn identical_rewrites_are_reused_and_changes_replace_the_page() {
        let dir = tempdir().expect("tempdir");
        let store = SnapshotStore::new(dir.path());
        let run = Uuid::new_v4();

        let first = store.store_page(run, 1, b"<html>cards</html>").await.expect("first");
        let again = store.store_page(run, 1, b"<html>cards</html>").await.expect("again");
        assert!(!first.reused);
        assert!(again.reused);

        let changed = store.store_page(run, 1, b"<html>more cards</html>").await.expect("changed");
        assert!(!changed.reused);
        assert_eq!(
            std::fs::read(&changed.path).expect("read"),
            b"<html>more cards</html>"
        );
        assert_eq!(store.pages_for_run(run).await.expect("list").len(), 1);
    }
}
