//! Build a manifest from a live filesystem tree.
//!
//! The walk is depth first with children in byte-lexicographic order. Each
//! directory contributes a comment naming it, its own relative entry, its
//! plain children, then its subdirectories, and a `..` pop on the way out.
//! Keyword values shared with the active `/set` frame are elided from
//! individual entries.

use std::ffi::OsString;
use std::fs::{self, File, Metadata};
use std::io::Read;
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use tracing::{debug, warn};

use crate::cancel::CancelFlag;
use crate::check::Failure;
use crate::hierarchy::{DirectoryHierarchy, Entry, EntryKind};
use crate::keywords::compute::{compute, needs_content};
use crate::keywords::{find, select, KeyVal, Keyword, SET_KEYWORDS};
use crate::vis::vis_token;

/// Decides whether an object is skipped entirely. Returning `true`
/// excludes the object (and, for a directory, everything below it).
pub type ExcludeFn = Box<dyn Fn(&Path, &Metadata) -> bool>;

/// Walks a tree and assembles a [`DirectoryHierarchy`].
///
/// Per-entry I/O problems do not stop the walk; they are recorded and can
/// be read back with [`failures`][Walker::failures] once the walk is done.
pub struct Walker {
    keywords: Vec<Keyword>,
    excludes: Vec<ExcludeFn>,
    cancel: Option<CancelFlag>,
    failures: Vec<Failure>,
}

/// Walks `root` with the given keywords, discarding per-entry failures.
pub fn walk(root: impl AsRef<Path>, keywords: &[Keyword]) -> Result<DirectoryHierarchy> {
    Walker::new(keywords).walk(root)
}

struct WalkState {
    dh: DirectoryHierarchy,
    active: Option<Vec<KeyVal>>,
    active_frame: Option<usize>,
}

impl Walker {
    pub fn new(keywords: &[Keyword]) -> Self {
        Walker {
            keywords: keywords.to_vec(),
            excludes: Vec::new(),
            cancel: None,
            failures: Vec::new(),
        }
    }

    /// Adds an exclusion filter.
    pub fn exclude(mut self, filter: ExcludeFn) -> Self {
        self.excludes.push(filter);
        self
    }

    /// Makes the walk cancellable; a cancelled walk returns the partial
    /// hierarchy assembled so far.
    pub fn with_cancel(mut self, flag: CancelFlag) -> Self {
        self.cancel = Some(flag);
        self
    }

    /// I/O failures recorded during the most recent walk.
    pub fn failures(&self) -> &[Failure] {
        &self.failures
    }

    pub fn walk(&mut self, root: impl AsRef<Path>) -> Result<DirectoryHierarchy> {
        let root = root.as_ref();
        self.failures.clear();
        let meta = fs::metadata(root).with_context(|| format!("stat {}", root.display()))?;
        if !meta.is_dir() {
            bail!("root {} is not a directory", root.display());
        }
        let mut state = WalkState {
            dh: DirectoryHierarchy::default(),
            active: None,
            active_frame: None,
        };
        self.visit_dir(
            &mut state,
            root,
            PathBuf::from("."),
            OsString::from("."),
            &meta,
            None,
        )?;
        Ok(state.dh)
    }

    fn cancelled(&self) -> bool {
        self.cancel.as_ref().is_some_and(CancelFlag::is_cancelled)
    }

    fn visit_dir(
        &mut self,
        state: &mut WalkState,
        dir: &Path,
        rel: PathBuf,
        name: OsString,
        meta: &Metadata,
        parent: Option<usize>,
    ) -> Result<()> {
        if self.cancelled() {
            debug!("walk cancelled at {}", rel.display());
            return Ok(());
        }
        let is_root = parent.is_none();
        if !is_root {
            let pos = state.dh.entries().len();
            state.dh.push(Entry::blank(pos));
        }
        let pos = state.dh.entries().len();
        let comment = format!("# {}", vis_token(rel.as_os_str().as_bytes()));
        state.dh.push(Entry::comment(pos, comment));

        self.refresh_set_frame(state, dir, meta);

        let keyvals = self.compute_keyvals(dir, &rel, meta);
        let keyvals = elide(keyvals, state.active.as_deref());
        let pos = state.dh.entries().len();
        let dir_index = state.dh.push(Entry {
            kind: EntryKind::Relative,
            pos,
            raw: String::new(),
            name,
            keyvals,
            parent,
            set: state.active_frame,
        });

        let mut children = Vec::new();
        match fs::read_dir(dir) {
            Ok(read_dir) => {
                for child in read_dir {
                    match child {
                        Ok(child) => children.push(child.file_name()),
                        Err(e) => self.record(&rel, "readdir", e),
                    }
                }
            }
            Err(e) => {
                self.record(&rel, "readdir", e);
                return Ok(());
            }
        }
        children.sort_by(|a, b| a.as_bytes().cmp(b.as_bytes()));

        let mut subdirs = Vec::new();
        for child_name in children {
            let child_path = dir.join(&child_name);
            let child_rel = rel.join(&child_name);
            let child_meta = match fs::symlink_metadata(&child_path) {
                Ok(meta) => meta,
                Err(e) => {
                    self.record(&child_rel, "stat", e);
                    continue;
                }
            };
            if self.excluded(&child_path, &child_meta) {
                debug!("excluded {}", child_rel.display());
                continue;
            }
            if child_meta.is_dir() {
                subdirs.push((child_name, child_meta));
                continue;
            }
            let keyvals = self.compute_keyvals(&child_path, &child_rel, &child_meta);
            let keyvals = elide(keyvals, state.active.as_deref());
            let pos = state.dh.entries().len();
            state.dh.push(Entry {
                kind: EntryKind::Relative,
                pos,
                raw: String::new(),
                name: child_name,
                keyvals,
                parent: Some(dir_index),
                set: state.active_frame,
            });
        }

        for (child_name, child_meta) in subdirs {
            let child_path = dir.join(&child_name);
            let child_rel = rel.join(&child_name);
            self.visit_dir(
                state,
                &child_path,
                child_rel,
                child_name,
                &child_meta,
                Some(dir_index),
            )?;
        }

        if !is_root {
            let pos = state.dh.entries().len();
            state.dh.push(Entry::dot_dot(pos));
        }
        Ok(())
    }

    /// Computes this directory's `/set` frame and emits a fresh `/set` line
    /// when it differs from the active one.
    fn refresh_set_frame(&mut self, state: &mut WalkState, dir: &Path, meta: &Metadata) {
        let mut frame = select(&default_set_keyvals(), &self.keywords);
        for keyword in &SET_KEYWORDS {
            if !self.keywords.contains(keyword) {
                continue;
            }
            match compute(keyword, dir, meta, None) {
                Ok(keyvals) => frame.extend(keyvals),
                Err(e) => warn!("computing {} for /set: {e:#}", keyword),
            }
        }
        if frame.is_empty() || state.active.as_deref() == Some(frame.as_slice()) {
            return;
        }
        let frame_index = state.dh.push_set_frame(frame.clone());
        let pos = state.dh.entries().len();
        state.dh.push(Entry::special(pos, "/set", frame.clone()));
        state.active = Some(frame);
        state.active_frame = Some(frame_index);
    }

    fn compute_keyvals(&mut self, path: &Path, rel: &Path, meta: &Metadata) -> Vec<KeyVal> {
        let mut keyvals = Vec::new();
        for keyword in &self.keywords {
            // Content keywords apply to regular files only; symlinks are
            // never followed for content.
            let mut content = if needs_content(keyword) && meta.is_file() {
                match File::open(path) {
                    Ok(file) => Some(file),
                    Err(e) => {
                        self.failures.push(Failure::io(rel, keyword.name(), &e));
                        warn!("open {}: {e}", rel.display());
                        continue;
                    }
                }
            } else {
                None
            };
            let reader = content.as_mut().map(|f| f as &mut dyn Read);
            match compute(keyword, path, meta, reader) {
                Ok(mut computed) => keyvals.append(&mut computed),
                Err(e) => {
                    self.failures
                        .push(Failure::io(rel, keyword.name(), e.root_cause()));
                    warn!("computing {} for {}: {e:#}", keyword, rel.display());
                }
            }
        }
        keyvals
    }

    fn excluded(&self, path: &Path, meta: &Metadata) -> bool {
        self.excludes.iter().any(|filter| filter(path, meta))
    }

    fn record(&mut self, rel: &Path, what: &str, error: impl std::fmt::Display) {
        warn!("{what} {}: {error}", rel.display());
        self.failures.push(Failure::io(rel, what, error));
    }
}

/// Keyvals every `/set` frame starts from, before the owning uid/gid.
fn default_set_keyvals() -> Vec<KeyVal> {
    vec![
        KeyVal::new(Keyword::Type, "file"),
        KeyVal::new(Keyword::Nlink, "1"),
        KeyVal::new(Keyword::Flags, "none"),
        KeyVal::new(Keyword::Mode, "0664"),
    ]
}

/// Drops keyvals whose value the active frame already supplies.
fn elide(keyvals: Vec<KeyVal>, active: Option<&[KeyVal]>) -> Vec<KeyVal> {
    let Some(active) = active else {
        return keyvals;
    };
    keyvals
        .into_iter()
        .filter(|kv| find(active, kv.keyword()) != Some(kv))
        .collect()
}
