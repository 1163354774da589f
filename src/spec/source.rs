//! Project source trees copied into images
//!
//! A [`SourceTree`] snapshots the files under a spec's `source_root`:
//! sorted relative paths with content digests. The digests are part of the
//! normalized spec, so they feed the fingerprint. The root directory is not,
//! so the same checkout in two places fingerprints identically.

use crate::error::{UvImageError, UvImageResult};
use glob::{MatchOptions, Pattern};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::debug;
use walkdir::{DirEntry, WalkDir};

/// Directories skipped at any depth
const STANDARD_IGNORED_DIRS: [&str; 10] = [
    ".git",
    ".hg",
    ".svn",
    "__pycache__",
    ".venv",
    "venv",
    ".mypy_cache",
    ".pytest_cache",
    ".ruff_cache",
    ".tox",
];

/// Files skipped at any depth. The image installs the resolved lock, not the project's own.
const STANDARD_IGNORED_FILES: [&str; 3] = [".DS_Store", "pyproject.toml", "uv.lock"];

const IGNORED_SUFFIXES: [&str; 2] = [".pyc", ".pyo"];

const MATCH_OPTIONS: MatchOptions = MatchOptions {
    case_sensitive: true,
    require_literal_separator: true,
    require_literal_leading_dot: false,
};

/// One copied file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceFile {
    /// Path relative to the source root, `/`-separated
    pub path: String,
    /// Hex SHA-256 of the content
    pub digest: String,
}

/// Snapshot of a project directory
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceTree {
    #[serde(skip)]
    pub root: PathBuf,
    pub files: Vec<SourceFile>,
}

impl SourceTree {
    /// Walk `root` and digest every file the ignore rules let through
    pub fn scan(root: &Path) -> UvImageResult<Self> {
        let invalid = |reason: String| UvImageError::spec_invalid("source_root", reason);

        let metadata = std::fs::metadata(root)
            .map_err(|e| invalid(format!("{}: {}", root.display(), e)))?;
        if !metadata.is_dir() {
            return Err(invalid(format!("{} is not a directory", root.display())));
        }

        let rules = IgnoreRules::load(root)?;
        let walker = WalkDir::new(root)
            .follow_links(false)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|entry| entry.depth() == 0 || !rules.ignores(root, entry));

        let mut files = Vec::new();
        for entry in walker {
            let entry = entry.map_err(|e| invalid(e.to_string()))?;
            let file_type = entry.file_type();
            if entry.depth() == 0 || file_type.is_dir() {
                continue;
            }
            if file_type.is_symlink() && !entry.path().is_file() {
                debug!("Skipping symlink {}", entry.path().display());
                continue;
            }
            let path = relative_path(root, entry.path())
                .ok_or_else(|| invalid(format!("{} is not valid UTF-8", entry.path().display())))?;
            files.push(SourceFile {
                digest: file_digest(entry.path())?,
                path,
            });
        }
        files.sort_by(|a, b| a.path.cmp(&b.path));

        debug!("Snapshot of {}: {} files", root.display(), files.len());
        Ok(Self {
            root: root.to_path_buf(),
            files,
        })
    }

    /// Copy every snapshotted file under `dest`, keeping relative paths
    pub async fn copy_to(&self, dest: &Path) -> UvImageResult<()> {
        tokio::fs::create_dir_all(dest)
            .await
            .map_err(|e| UvImageError::io(format!("creating {}", dest.display()), e))?;
        for file in &self.files {
            let from = self.root.join(&file.path);
            let to = dest.join(&file.path);
            if let Some(parent) = to.parent() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|e| UvImageError::io(format!("creating {}", parent.display()), e))?;
            }
            tokio::fs::copy(&from, &to)
                .await
                .map_err(|e| UvImageError::io(format!("copying {}", from.display()), e))?;
        }
        Ok(())
    }
}

/// `/`-joined path of `path` below `root`
fn relative_path(root: &Path, path: &Path) -> Option<String> {
    let rel = path.strip_prefix(root).ok()?;
    let parts: Option<Vec<&str>> = rel.components().map(|c| c.as_os_str().to_str()).collect();
    Some(parts?.join("/"))
}

fn file_digest(path: &Path) -> UvImageResult<String> {
    let context = || format!("reading {}", path.display());
    let mut file = File::open(path).map_err(|e| UvImageError::io(context(), e))?;
    let mut hasher = Sha256::new();
    std::io::copy(&mut file, &mut hasher).map_err(|e| UvImageError::io(context(), e))?;
    Ok(hex::encode(hasher.finalize()))
}

/// One line of a `.gitignore` or `.dockerignore`
#[derive(Debug)]
struct IgnoreRule {
    pattern: Pattern,
    negated: bool,
    dir_only: bool,
    /// Matched against the whole relative path instead of the file name
    anchored: bool,
}

impl IgnoreRule {
    fn parse(line: &str, always_anchored: bool) -> Option<Self> {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            return None;
        }
        let (negated, body) = match line.strip_prefix('!') {
            Some(rest) => (true, rest),
            None => (false, line),
        };
        let dir_only = body.ends_with('/');
        let body = body.trim_end_matches('/');
        let anchored = always_anchored || body.contains('/');
        let body = body.trim_start_matches("./").trim_start_matches('/');
        if body.is_empty() {
            return None;
        }
        match Pattern::new(body) {
            Ok(pattern) => Some(Self {
                pattern,
                negated,
                dir_only,
                anchored,
            }),
            Err(e) => {
                debug!("Skipping ignore pattern '{}': {}", line, e);
                None
            }
        }
    }

    fn matches(&self, rel: &str, name: &str, is_dir: bool) -> bool {
        if self.dir_only && !is_dir {
            return false;
        }
        let subject = if self.anchored { rel } else { name };
        self.pattern.matches_with(subject, MATCH_OPTIONS)
    }
}

/// Root-level ignore files plus the built-in skips
#[derive(Debug, Default)]
struct IgnoreRules {
    rules: Vec<IgnoreRule>,
}

impl IgnoreRules {
    fn load(root: &Path) -> UvImageResult<Self> {
        let mut rules = Vec::new();
        for (name, anchored) in [(".gitignore", false), (".dockerignore", true)] {
            let path = root.join(name);
            let content = match std::fs::read_to_string(&path) {
                Ok(content) => content,
                Err(e) if e.kind() == ErrorKind::NotFound => continue,
                Err(e) => return Err(UvImageError::io(format!("reading {}", path.display()), e)),
            };
            rules.extend(content.lines().filter_map(|line| IgnoreRule::parse(line, anchored)));
        }
        Ok(Self { rules })
    }

    fn ignores(&self, root: &Path, entry: &DirEntry) -> bool {
        let Some(rel) = relative_path(root, entry.path()) else {
            // Surfaced as an error by the walk
            return false;
        };
        let name = rel.rsplit('/').next().unwrap_or(rel.as_str());
        self.is_ignored(&rel, name, entry.file_type().is_dir())
    }

    fn is_ignored(&self, rel: &str, name: &str, is_dir: bool) -> bool {
        let standard = if is_dir {
            STANDARD_IGNORED_DIRS.contains(&name)
        } else {
            STANDARD_IGNORED_FILES.contains(&name)
                || IGNORED_SUFFIXES.iter().any(|suffix| name.ends_with(suffix))
        };
        if standard {
            return true;
        }
        // Last matching rule wins
        self.rules
            .iter()
            .rev()
            .find(|rule| rule.matches(rel, name, is_dir))
            .is_some_and(|rule| !rule.negated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write(root: &Path, rel: &str, content: &str) {
        let path = root.join(rel);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, content).unwrap();
    }

    fn paths(tree: &SourceTree) -> Vec<&str> {
        tree.files.iter().map(|f| f.path.as_str()).collect()
    }

    #[test]
    fn skips_caches_venvs_and_uv_project_files() {
        let temp = TempDir::new().unwrap();
        let root = temp.path();
        write(root, "main.py", "print('hi')");
        write(root, "pkg/util.py", "X = 1");
        write(root, "pkg/__pycache__/util.cpython-312.pyc", "");
        write(root, "stale.pyc", "");
        write(root, "pyproject.toml", "[project]");
        write(root, "uv.lock", "version = 1");
        write(root, ".venv/bin/python", "");
        write(root, ".git/HEAD", "ref: refs/heads/main");

        let tree = SourceTree::scan(root).unwrap();
        assert_eq!(paths(&tree), vec!["main.py", "pkg/util.py"]);
        assert_eq!(tree.root, root);
    }

    #[test]
    fn gitignore_patterns_match_at_any_depth() {
        let temp = TempDir::new().unwrap();
        let root = temp.path();
        write(root, ".gitignore", "# logs\n*.log\n!keep.log\nbuild/\n/data\n");
        write(root, "debug.log", "");
        write(root, "keep.log", "");
        write(root, "build/out.txt", "");
        write(root, "sub/build/out.txt", "");
        write(root, "data/raw.csv", "");
        write(root, "sub/data/raw.csv", "");

        let tree = SourceTree::scan(root).unwrap();
        assert_eq!(paths(&tree), vec![".gitignore", "keep.log", "sub/data/raw.csv"]);
    }

    #[test]
    fn dockerignore_patterns_are_anchored() {
        let temp = TempDir::new().unwrap();
        let root = temp.path();
        write(root, ".dockerignore", "docs\n*.tmp\n");
        write(root, "docs/index.md", "");
        write(root, "sub/docs/index.md", "");
        write(root, "scratch.tmp", "");
        write(root, "sub/scratch.tmp", "");

        let tree = SourceTree::scan(root).unwrap();
        assert_eq!(
            paths(&tree),
            vec![".dockerignore", "sub/docs/index.md", "sub/scratch.tmp"]
        );
    }

    #[test]
    fn digests_follow_content_not_location() {
        let a = TempDir::new().unwrap();
        let b = TempDir::new().unwrap();
        write(a.path(), "app.py", "v1");
        write(b.path(), "app.py", "v1");
        let first = SourceTree::scan(a.path()).unwrap();
        let second = SourceTree::scan(b.path()).unwrap();
        assert_eq!(first.files, second.files);
        assert_eq!(
            serde_json::to_string(&first).unwrap(),
            serde_json::to_string(&second).unwrap()
        );

        write(b.path(), "app.py", "v2");
        let edited = SourceTree::scan(b.path()).unwrap();
        assert_ne!(first.files, edited.files);
    }

    #[test]
    fn missing_or_file_root_rejected() {
        let temp = TempDir::new().unwrap();
        let err = SourceTree::scan(&temp.path().join("absent")).unwrap_err();
        assert!(matches!(err, UvImageError::SpecInvalid { ref field, .. } if field == "source_root"));

        write(temp.path(), "file.py", "");
        let err = SourceTree::scan(&temp.path().join("file.py")).unwrap_err();
        assert!(err.to_string().contains("is not a directory"));
    }

    #[tokio::test]
    async fn copy_to_recreates_the_tree() {
        let src = TempDir::new().unwrap();
        let dest = TempDir::new().unwrap();
        write(src.path(), "main.py", "print('hi')");
        write(src.path(), "pkg/util.py", "X = 1");
        write(src.path(), "uv.lock", "version = 1");

        let tree = SourceTree::scan(src.path()).unwrap();
        let target = dest.path().join("src");
        tree.copy_to(&target).await.unwrap();

        assert_eq!(
            std::fs::read_to_string(target.join("pkg/util.py")).unwrap(),
            "X = 1"
        );
        assert!(target.join("main.py").exists());
        assert!(!target.join("uv.lock").exists());
    }
}
