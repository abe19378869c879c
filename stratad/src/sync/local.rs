use std::collections::BTreeMap;
use std::fs::{self, Metadata};
use std::io;
use std::path::{Component, Path, PathBuf};
use std::time::UNIX_EPOCH;

use globset::{Glob, GlobSet, GlobSetBuilder};

use super::EngineError;
use super::diff::LocalItem;

/// Suffix of in-flight downloads; such files are never synced.
pub const PARTIAL_SUFFIX: &str = ".strata-part";

/// Ignore patterns of a config. A pattern matches either the whole relative
/// path or its last segment.
#[derive(Debug, Clone)]
pub struct IgnoreSet {
    set: GlobSet,
}

impl IgnoreSet {
    pub fn new(patterns: &[String]) -> Result<Self, globset::Error> {
        let mut builder = GlobSetBuilder::new();
        for pattern in patterns {
            builder.add(Glob::new(pattern)?);
        }
        Ok(Self {
            set: builder.build()?,
        })
    }

    pub fn is_ignored(&self, rel_path: &str) -> bool {
        let name = rel_path.rsplit('/').next().unwrap_or(rel_path);
        name.ends_with(PARTIAL_SUFFIX) || self.set.is_match(rel_path) || self.set.is_match(name)
    }
}

/// Maps a relative path under `root`, refusing anything that would escape it.
pub fn local_path_for(root: &Path, rel_path: &str) -> Result<PathBuf, EngineError> {
    if rel_path.is_empty() {
        return Err(EngineError::InvalidConfig("relative path is empty".into()));
    }
    let mut out = root.to_path_buf();
    for component in Path::new(rel_path).components() {
        match component {
            Component::Normal(part) => out.push(part),
            Component::CurDir => {}
            Component::RootDir | Component::ParentDir | Component::Prefix(_) => {
                return Err(EngineError::InvalidConfig(format!(
                    "relative path '{rel_path}' escapes the sync root"
                )));
            }
        }
    }
    Ok(out)
}

/// Sibling temp file a download is written to before the rename.
pub fn partial_path(target: &Path) -> PathBuf {
    let name = target
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
    target.with_file_name(format!(".{name}{PARTIAL_SUFFIX}"))
}

pub fn mtime_of(meta: &Metadata) -> i64 {
    meta.modified()
        .ok()
        .and_then(|time| time.duration_since(UNIX_EPOCH).ok())
        .map(|elapsed| elapsed.as_secs() as i64)
        .unwrap_or(0)
}

/// Walks `root` (creating it when missing) and returns every regular file by
/// relative path. Symlinks are skipped. Blocking; run it off the async runtime.
pub fn scan_local(root: &Path, ignore: &IgnoreSet) -> io::Result<BTreeMap<String, LocalItem>> {
    fs::create_dir_all(root)?;
    let mut out = BTreeMap::new();
    let mut pending = vec![root.to_path_buf()];
    while let Some(dir) = pending.pop() {
        for entry in fs::read_dir(&dir)? {
            let entry = entry?;
            let meta = fs::symlink_metadata(entry.path())?;
            let Ok(relative) = entry.path().strip_prefix(root).map(Path::to_path_buf) else {
                continue;
            };
            let rel_path = relative.to_string_lossy().replace('\\', "/");
            if ignore.is_ignored(&rel_path) {
                continue;
            }
            if meta.is_dir() {
                pending.push(entry.path());
            } else if meta.is_file() {
                out.insert(
                    rel_path,
                    LocalItem {
                        size: meta.len() as i64,
                        mtime: mtime_of(&meta),
                    },
                );
            }
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_relative_paths_under_the_root() {
        let root = PathBuf::from("/sync");
        assert_eq!(
            local_path_for(&root, "docs/a.txt").unwrap(),
            PathBuf::from("/sync/docs/a.txt")
        );
        assert!(local_path_for(&root, "../secret").is_err());
        assert!(local_path_for(&root, "/etc/passwd").is_err());
        assert!(local_path_for(&root, "").is_err());
    }

    #[test]
    fn partial_files_are_hidden_siblings() {
        let target = PathBuf::from("/sync/docs/a.txt");
        let partial = partial_path(&target);
        assert_eq!(partial, PathBuf::from("/sync/docs/.a.txt.strata-part"));
        let ignore = IgnoreSet::new(&[]).unwrap();
        assert!(ignore.is_ignored("docs/.a.txt.strata-part"));
    }

    #[test]
    fn ignore_patterns_match_paths_or_names() {
        let ignore = IgnoreSet::new(&["*.tmp".into(), "build/**".into()]).unwrap();
        assert!(ignore.is_ignored("notes.tmp"));
        assert!(ignore.is_ignored("deep/dir/notes.tmp"));
        assert!(ignore.is_ignored("build/out/x.o"));
        assert!(!ignore.is_ignored("src/main.rs"));
    }

    #[test]
    fn scan_lists_nested_files_and_skips_ignored_ones() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("a/b")).unwrap();
        fs::write(dir.path().join("top.txt"), b"12345").unwrap();
        fs::write(dir.path().join("a/b/deep.txt"), b"x").unwrap();
        fs::write(dir.path().join("a/skip.tmp"), b"x").unwrap();

        let ignore = IgnoreSet::new(&["*.tmp".into()]).unwrap();
        let items = scan_local(dir.path(), &ignore).unwrap();
        assert_eq!(
            items.keys().cloned().collect::<Vec<_>>(),
            vec!["a/b/deep.txt".to_string(), "top.txt".to_string()]
        );
        assert_eq!(items["top.txt"].size, 5);
    }

    #[test]
    fn scan_creates_a_missing_root() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("fresh");
        let items = scan_local(&root, &IgnoreSet::new(&[]).unwrap()).unwrap();
        assert!(items.is_empty());
        assert!(root.is_dir());
    }
}
