//! Apply manifest values back onto a live tree.
//!
//! The updater only ever mutates metadata of objects that already exist;
//! it creates and deletes nothing. It iterates the manifest in source
//! order from inside the root, so relative entry paths resolve directly.

use std::env;
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::debug;

use crate::cancel::CancelFlag;
use crate::check::{CheckResult, Failure};
use crate::hierarchy::EntryKind;
use crate::keywords::update::{has_update, update as apply_keyword};
use crate::keywords::Keyword;
use crate::vis::vis_token;
use crate::DirectoryHierarchy;

/// Applies the manifest's values for `keywords` to the tree at `root`.
///
/// Per-entry failures are accumulated and do not stop the run. The
/// process-wide working directory is changed for the duration and restored
/// on every exit path; concurrent callers must serialise.
pub fn update(
    root: impl AsRef<Path>,
    dh: &DirectoryHierarchy,
    keywords: &[Keyword],
    cancel: Option<CancelFlag>,
) -> Result<CheckResult> {
    let _guard = WorkingDirGuard::enter(root.as_ref())?;
    let mut result = CheckResult::default();
    for entry in dh.entries() {
        if cancel.as_ref().is_some_and(CancelFlag::is_cancelled) {
            break;
        }
        if !matches!(entry.kind, EntryKind::Relative | EntryKind::Full) {
            continue;
        }
        let path = dh.path_of(entry);
        for kv in dh.effective_keyvals(entry) {
            if !wants_keyword(keywords, kv.keyword()) {
                continue;
            }
            if !has_update(kv.keyword()) {
                debug!("no update for keyword {}; skipping", kv.keyword());
                continue;
            }
            if let Err(error) = apply_keyword(kv.keyword(), &path, kv.value()) {
                result.failures.push(Failure {
                    path: vis_token(path.as_os_str().as_bytes()),
                    keyword: kv.keyword().name(),
                    expected: kv.value().to_owned(),
                    got: format!("{error:#}"),
                });
            }
        }
    }
    Ok(result)
}

/// `time` and `tar_time` select each other: a manifest built from an
/// archive can still be applied with the default update set.
fn wants_keyword(keywords: &[Keyword], keyword: &Keyword) -> bool {
    if keywords.contains(keyword) {
        return true;
    }
    match keyword {
        Keyword::Time => keywords.contains(&Keyword::TarTime),
        Keyword::TarTime => keywords.contains(&Keyword::Time),
        _ => false,
    }
}

/// Scoped `chdir`: restores the previous working directory when dropped.
struct WorkingDirGuard {
    previous: PathBuf,
}

impl WorkingDirGuard {
    fn enter(root: &Path) -> Result<Self> {
        let previous = env::current_dir().context("read working directory")?;
        env::set_current_dir(root).with_context(|| format!("chdir {}", root.display()))?;
        Ok(WorkingDirGuard { previous })
    }
}

impl Drop for WorkingDirGuard {
    fn drop(&mut self) {
        if let Err(error) = env::set_current_dir(&self.previous) {
            tracing::warn!(
                "could not restore working directory {}: {error}",
                self.previous.display()
            );
        }
    }
}
