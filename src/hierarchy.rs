//! The in-memory form of a manifest: a flat, ordered list of entries.
//!
//! Entries reference their enclosing directory and their active `/set`
//! frame by index into the owning [`DirectoryHierarchy`], so the flat list
//! owns everything and full paths are resolved on demand by walking the
//! parent chain.

use std::ffi::OsString;
use std::fmt;
use std::io::{self, Write};
use std::os::unix::ffi::OsStrExt;
use std::path::{Component, Path, PathBuf};

use crate::keywords::{find, merge_set, KeyVal, Keyword};
use crate::vis::vis_token;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    /// An empty line, preserved on output.
    Blank,
    /// A `# ...` comment line, preserved verbatim.
    Comment,
    /// A `/set`, `/unset` or `/comment` directive.
    Special,
    /// A bare basename resolved against the enclosing directory entry.
    Relative,
    /// The literal `..`: pop one level of the directory stack.
    DotDot,
    /// A path containing `/`, resolved against the manifest root.
    Full,
}

/// One manifest line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    pub kind: EntryKind,
    /// Position in source order; stable across re-emission.
    pub pos: usize,
    /// The verbatim line, kept for comments and `/comment` directives.
    pub raw: String,
    /// Decoded name bytes: a basename, a full path, `..`, or the directive
    /// name for specials.
    pub name: OsString,
    pub keyvals: Vec<KeyVal>,
    /// Index of the enclosing directory entry.
    pub parent: Option<usize>,
    /// Index of the active `/set` frame in the owning hierarchy.
    pub set: Option<usize>,
}

impl Entry {
    pub fn blank(pos: usize) -> Self {
        Entry {
            kind: EntryKind::Blank,
            pos,
            raw: String::new(),
            name: OsString::new(),
            keyvals: vec![],
            parent: None,
            set: None,
        }
    }

    pub fn comment(pos: usize, raw: impl Into<String>) -> Self {
        Entry {
            kind: EntryKind::Comment,
            pos,
            raw: raw.into(),
            name: OsString::new(),
            keyvals: vec![],
            parent: None,
            set: None,
        }
    }

    pub fn special(pos: usize, name: impl Into<OsString>, keyvals: Vec<KeyVal>) -> Self {
        Entry {
            kind: EntryKind::Special,
            pos,
            raw: String::new(),
            name: name.into(),
            keyvals,
            parent: None,
            set: None,
        }
    }

    pub fn dot_dot(pos: usize) -> Self {
        Entry {
            kind: EntryKind::DotDot,
            pos,
            raw: String::new(),
            name: OsString::from(".."),
            keyvals: vec![],
            parent: None,
            set: None,
        }
    }

    /// Whether this entry describes a directory, judged on its own keyvals.
    pub fn is_dir(&self) -> bool {
        find(&self.keyvals, &Keyword::Type).map(|kv| kv.value()) == Some("dir")
    }
}

impl fmt::Display for Entry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            EntryKind::Blank => Ok(()),
            EntryKind::Comment => f.write_str(&self.raw),
            EntryKind::DotDot => f.write_str(".."),
            EntryKind::Special if !self.raw.is_empty() => f.write_str(&self.raw),
            EntryKind::Special | EntryKind::Full => {
                f.write_str(&vis_token(self.name.as_bytes()))?;
                for kv in &self.keyvals {
                    write!(f, " {kv}")?;
                }
                Ok(())
            }
            EntryKind::Relative => {
                // Plain files are indented beneath their directory.
                if !self.is_dir() {
                    f.write_str("    ")?;
                }
                f.write_str(&vis_token(self.name.as_bytes()))?;
                for kv in &self.keyvals {
                    write!(f, " {kv}")?;
                }
                Ok(())
            }
        }
    }
}

/// An ordered sequence of manifest entries plus the resolved `/set` frames
/// they refer to.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct DirectoryHierarchy {
    entries: Vec<Entry>,
    sets: Vec<Vec<KeyVal>>,
}

impl DirectoryHierarchy {
    pub fn entries(&self) -> &[Entry] {
        &self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Appends an entry, returning its index.
    pub(crate) fn push(&mut self, entry: Entry) -> usize {
        self.entries.push(entry);
        self.entries.len() - 1
    }

    /// Records a resolved `/set` frame, returning its index. Identical
    /// consecutive frames are collapsed.
    pub(crate) fn push_set_frame(&mut self, frame: Vec<KeyVal>) -> usize {
        if let Some(last) = self.sets.last() {
            if *last == frame {
                return self.sets.len() - 1;
            }
        }
        self.sets.push(frame);
        self.sets.len() - 1
    }

    pub fn set_frame(&self, index: usize) -> &[KeyVal] {
        &self.sets[index]
    }

    /// The entry's keyvals with its `/set` frame folded in; the entry's own
    /// values win for shared keywords.
    pub fn effective_keyvals(&self, entry: &Entry) -> Vec<KeyVal> {
        match entry.set {
            Some(index) => merge_set(&self.sets[index], &entry.keyvals),
            None => merge_set(&[], &entry.keyvals),
        }
    }

    /// The decoded path of an entry, resolved through its parent chain and
    /// cleaned of `.` components. The root directory entry resolves to `.`.
    pub fn path_of(&self, entry: &Entry) -> PathBuf {
        let mut names = vec![entry.name.as_os_str()];
        let mut parent = entry.parent;
        while let Some(index) = parent {
            let ancestor = &self.entries[index];
            names.push(ancestor.name.as_os_str());
            parent = ancestor.parent;
        }
        let mut path = PathBuf::new();
        for name in names.iter().rev() {
            path.push(name);
        }
        clean_path(&path)
    }

    /// Every keyword used by any entry or `/set` line, in first-seen order.
    pub fn used_keywords(&self) -> Vec<Keyword> {
        let mut seen = Vec::new();
        for entry in &self.entries {
            for kv in &entry.keyvals {
                if !seen.contains(kv.keyword()) {
                    seen.push(kv.keyword().clone());
                }
            }
        }
        seen
    }

    /// Serialises the manifest in source order.
    pub fn write_to(&self, writer: &mut dyn Write) -> io::Result<()> {
        for entry in &self.entries {
            writeln!(writer, "{entry}")?;
        }
        Ok(())
    }

    pub fn to_text(&self) -> String {
        let mut buf = Vec::new();
        self.write_to(&mut buf).expect("write to vec");
        String::from_utf8(buf).expect("manifest text is ASCII")
    }
}

/// Drops `.` components; an empty result is the root itself.
fn clean_path(path: &Path) -> PathBuf {
    let cleaned: PathBuf = path
        .components()
        .filter(|c| !matches!(c, Component::CurDir))
        .collect();
    if cleaned.as_os_str().is_empty() {
        PathBuf::from(".")
    } else {
        cleaned
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keywords::KeyVal;

    fn kv(token: &str) -> KeyVal {
        KeyVal::parse(token).unwrap()
    }

    fn relative(pos: usize, name: &str, keyvals: Vec<KeyVal>, parent: Option<usize>) -> Entry {
        Entry {
            kind: EntryKind::Relative,
            pos,
            raw: String::new(),
            name: name.into(),
            keyvals,
            parent,
            set: None,
        }
    }

    #[test]
    fn paths_resolve_through_parents() {
        let mut dh = DirectoryHierarchy::default();
        let root = dh.push(relative(0, ".", vec![kv("type=dir")], None));
        let sub = dh.push(relative(1, "b", vec![kv("type=dir")], Some(root)));
        dh.push(relative(2, "c", vec![kv("type=file")], Some(sub)));

        assert_eq!(dh.path_of(&dh.entries()[0]), PathBuf::from("."));
        assert_eq!(dh.path_of(&dh.entries()[1]), PathBuf::from("b"));
        assert_eq!(dh.path_of(&dh.entries()[2]), PathBuf::from("b/c"));
    }

    #[test]
    fn effective_keyvals_fold_in_the_set_frame() {
        let mut dh = DirectoryHierarchy::default();
        let frame = dh.push_set_frame(vec![kv("uid=0"), kv("mode=0644")]);
        let mut entry = relative(0, "f", vec![kv("mode=0755")], None);
        entry.set = Some(frame);
        let index = dh.push(entry);

        assert_eq!(
            dh.effective_keyvals(&dh.entries()[index]),
            vec![kv("uid=0"), kv("mode=0755")]
        );
    }

    #[test]
    fn display_indents_plain_files() {
        let dir = relative(0, "sub", vec![kv("type=dir"), kv("mode=0755")], None);
        let file = relative(1, "a b", vec![kv("size=5")], Some(0));
        assert_eq!(dir.to_string(), "sub type=dir mode=0755");
        assert_eq!(file.to_string(), "    a\\040b size=5");
    }

    #[test]
    fn identical_set_frames_collapse() {
        let mut dh = DirectoryHierarchy::default();
        let a = dh.push_set_frame(vec![kv("uid=0")]);
        let b = dh.push_set_frame(vec![kv("uid=0")]);
        let c = dh.push_set_frame(vec![kv("uid=1")]);
        assert_eq!(a, b);
        assert_ne!(b, c);
    }
}
