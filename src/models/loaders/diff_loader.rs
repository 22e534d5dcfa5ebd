use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::fs;

use crate::error::DiffError;
use crate::models::commit::{CommitDiff, CommitMeta, FileDiff};

/// Diff 来源
///
/// 评分核心不关心 diff 来自本地仓库还是托管平台 API。
#[async_trait]
pub trait DiffSource: Send + Sync {
    async fn load_commits(&self) -> Result<Vec<CommitDiff>, DiffError>;
}

/// 从目录中读取 `*.diff` / `*.patch` 文件（`git format-patch` 输出）
pub struct DirectoryDiffSource {
    folder: PathBuf,
}

impl DirectoryDiffSource {
    pub fn new(folder: impl Into<PathBuf>) -> Self {
        Self {
            folder: folder.into(),
        }
    }
}

#[async_trait]
impl DiffSource for DirectoryDiffSource {
    async fn load_commits(&self) -> Result<Vec<CommitDiff>, DiffError> {
        load_all_diff_files(&self.folder).await
    }
}

/// 读取单个 patch 文件
pub async fn load_diff_file(path: &Path) -> Result<CommitDiff, DiffError> {
    let content = fs::read_to_string(path)
        .await
        .map_err(|source| DiffError::ReadFailed {
            path: path.to_path_buf(),
            source,
        })?;

    let fallback_name = path
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_default();

    let mut commit = parse_patch(&content, &fallback_name);
    commit.source_path = Some(path.to_string_lossy().to_string());
    Ok(commit)
}

/// 从文件夹中加载所有 patch 文件，按文件名排序
pub async fn load_all_diff_files(folder: &Path) -> Result<Vec<CommitDiff>, DiffError> {
    if !folder.exists() {
        return Err(DiffError::DirectoryNotFound {
            path: folder.to_path_buf(),
        });
    }

    let read_failed = |source| DiffError::ReadFailed {
        path: folder.to_path_buf(),
        source,
    };

    let mut paths = Vec::new();
    let mut entries = fs::read_dir(folder).await.map_err(read_failed)?;
    while let Some(entry) = entries.next_entry().await.map_err(read_failed)? {
        let path = entry.path();
        if matches!(
            path.extension().and_then(|s| s.to_str()),
            Some("diff") | Some("patch")
        ) {
            paths.push(path);
        }
    }
    paths.sort();

    let mut commits = Vec::new();
    for path in paths {
        tracing::info!(
            "正在加载: {}",
            path.file_name().unwrap_or_default().to_string_lossy()
        );
        match load_diff_file(&path).await {
            Ok(commit) => {
                tracing::info!("成功加载 {} 个文件 diff", commit.files.len());
                commits.push(commit);
            }
            Err(e) => {
                tracing::warn!("加载文件失败 {}: {}", path.display(), e);
            }
        }
    }

    Ok(commits)
}

/// 解析 `git format-patch` 格式的文本
///
/// 没有 `diff --git` 分段时，整段文本视为一个文件 diff。
pub fn parse_patch(content: &str, fallback_name: &str) -> CommitDiff {
    let mut meta = CommitMeta::default();
    let mut files: Vec<FileDiff> = Vec::new();
    let mut current: Option<FileDiff> = None;

    for line in content.split_inclusive('\n') {
        if let Some(rest) = line.strip_prefix("diff --git ") {
            if let Some(done) = current.take() {
                files.push(done);
            }
            current = Some(FileDiff {
                path: target_path(rest),
                diff: line.to_string(),
            });
            continue;
        }

        match current.as_mut() {
            Some(file) => file.diff.push_str(line),
            None => parse_header_line(line.trim_end(), &mut meta),
        }
    }
    if let Some(done) = current.take() {
        files.push(done);
    }

    // 去掉 format-patch 末尾的版本签名
    if let Some(last) = files.last_mut() {
        if let Some(pos) = last.diff.rfind("\n-- \n") {
            last.diff.truncate(pos + 1);
        }
    }

    if files.is_empty() && !content.trim().is_empty() {
        files.push(FileDiff {
            path: fallback_name.to_string(),
            diff: content.to_string(),
        });
    }

    if meta.hash.is_empty() {
        meta.hash = fallback_name.to_string();
    }

    CommitDiff {
        meta,
        files,
        source_path: None,
    }
}

fn parse_header_line(line: &str, meta: &mut CommitMeta) {
    if let Some(author) = line.strip_prefix("From: ") {
        meta.author = author.trim().to_string();
    } else if let Some(date) = line.strip_prefix("Date: ") {
        meta.date = date.trim().to_string();
    } else if let Some(subject) = line.strip_prefix("Subject: ") {
        meta.message = strip_patch_tag(subject.trim()).to_string();
    } else if let Some(rest) = line.strip_prefix("From ") {
        if let Some(hash) = rest.split_whitespace().next() {
            if hash.len() >= 7 && hash.chars().all(|c| c.is_ascii_hexdigit()) {
                meta.hash = hash.to_string();
            }
        }
    }
}

fn strip_patch_tag(subject: &str) -> &str {
    if subject.starts_with('[') {
        if let Some(end) = subject.find(']') {
            return subject[end + 1..].trim_start();
        }
    }
    subject
}

/// `a/src/x.rs b/src/x.rs` → `src/x.rs`
fn target_path(rest: &str) -> String {
    let rest = rest.trim_end();
    match rest.rfind(" b/") {
        Some(pos) => rest[pos + 3..].to_string(),
        None => rest
            .split_whitespace()
            .last()
            .unwrap_or(rest)
            .trim_start_matches("b/")
            .to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PATCH: &str = "From 3f2a9c1d5e7b8a9c0d1e2f3a4b5c6d7e8f9a0b1c Mon Sep 17 00:00:00 2001
From: Jane Doe <jane@example.com>
Date: Tue, 3 Oct 2023 12:00:00 +0200
Subject: [PATCH] Handle empty input in parser

---
 src/parser.rs | 3 ++-
 1 file changed, 2 insertions(+), 1 deletion(-)

diff --git a/src/parser.rs b/src/parser.rs
index 1111111..2222222 100644
--- a/src/parser.rs
+++ b/src/parser.rs
@@ -1,3 +1,4 @@
 fn parse(input: &str) {
-    let x = input.len();
+    if input.is_empty() { return; }
+    let x = input.len();
 }
diff --git a/README.md b/README.md
index 3333333..4444444 100644
--- a/README.md
+++ b/README.md
@@ -1 +1 @@
-old
+new
--\x20
2.39.0
";

    #[test]
    fn test_parse_patch_header_and_files() {
        let commit = parse_patch(PATCH, "0001");

        assert_eq!(commit.meta.hash, "3f2a9c1d5e7b8a9c0d1e2f3a4b5c6d7e8f9a0b1c");
        assert_eq!(commit.meta.author, "Jane Doe <jane@example.com>");
        assert_eq!(commit.meta.message, "Handle empty input in parser");
        assert_eq!(commit.short_hash(), "3f2a9c1d");

        assert_eq!(commit.files.len(), 2);
        assert_eq!(commit.files[0].path, "src/parser.rs");
        assert!(commit.files[0].diff.starts_with("diff --git"));
        assert_eq!(commit.files[1].path, "README.md");
        assert!(commit.files[1].diff.ends_with("+new\n"));
    }

    #[test]
    fn test_plain_diff_without_header() {
        let commit = parse_patch("+added line\n", "loose");
        assert_eq!(commit.meta.hash, "loose");
        assert_eq!(commit.files.len(), 1);
        assert_eq!(commit.files[0].path, "loose");
    }

    #[tokio::test]
    async fn test_load_folder_filters_extensions() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("0001-fix.patch"), PATCH).unwrap();
        std::fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        let commits = DirectoryDiffSource::new(dir.path())
            .load_commits()
            .await
            .unwrap();

        assert_eq!(commits.len(), 1);
        assert_eq!(commits[0].files.len(), 2);
    }

    #[test]
    fn test_load_single_file_keeps_source_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("0001-fix.patch");
        std::fs::write(&path, PATCH).unwrap();

        let commit = tokio_test::block_on(load_diff_file(&path)).unwrap();

        assert_eq!(commit.source_path.as_deref(), path.to_str());
        assert_eq!(commit.meta.date, "Tue, 3 Oct 2023 12:00:00 +0200");
    }

    #[tokio::test]
    async fn test_missing_folder_is_error() {
        let result = load_all_diff_files(Path::new("/definitely/not/here")).await;
        assert!(matches!(result, Err(DiffError::DirectoryNotFound { .. })));
    }
}
