//! Build a manifest from a streaming tar archive.
//!
//! The streamer drains an archive through [`tar::Archive`], keeping no more
//! state per entry than its header and one set of hash contexts. Entries
//! appear in the order the archive presents them; parents the archive never
//! names are synthesised as plain `type=dir` entries. `tar_time` is the
//! canonical timestamp keyword, since tar headers carry whole seconds only.

use std::ffi::OsString;
use std::io::Read;
use std::os::unix::ffi::{OsStrExt, OsStringExt};
use std::path::PathBuf;

use anyhow::{Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use tar::{Archive, EntryType};
use tracing::{debug, warn};

use crate::hierarchy::{DirectoryHierarchy, Entry, EntryKind};
use crate::keywords::compute::{format_mode, needs_content, ContentHasher};
use crate::keywords::{find, select, KeyVal, Keyword};
use crate::vis::vis_token;

/// Accumulates archive entries into a directory tree, then lays the tree
/// out as a hierarchy.
pub struct TarStreamer {
    keywords: Vec<Keyword>,
    root: Node,
}

/// Streams one whole archive with the given keywords.
pub fn stream(reader: impl Read, keywords: &[Keyword]) -> Result<DirectoryHierarchy> {
    let mut streamer = TarStreamer::new(keywords);
    streamer.read_from(reader)?;
    Ok(streamer.hierarchy())
}

struct Node {
    name: OsString,
    keyvals: Vec<KeyVal>,
    children: Vec<Node>,
}

impl Node {
    fn synthesized_dir(name: OsString) -> Self {
        Node {
            name,
            keyvals: vec![KeyVal::new(Keyword::Type, "dir")],
            children: Vec::new(),
        }
    }

    fn child_mut(&mut self, name: &[u8]) -> &mut Node {
        if let Some(index) = self
            .children
            .iter()
            .position(|c| c.name.as_bytes() == name)
        {
            return &mut self.children[index];
        }
        self.children
            .push(Node::synthesized_dir(OsString::from_vec(name.to_vec())));
        self.children.last_mut().expect("just pushed")
    }
}

impl TarStreamer {
    pub fn new(keywords: &[Keyword]) -> Self {
        TarStreamer {
            keywords: keywords.to_vec(),
            root: Node::synthesized_dir(OsString::from(".")),
        }
    }

    /// Drains a whole archive byte stream into the tree.
    pub fn read_from(&mut self, reader: impl Read) -> Result<()> {
        let mut archive = Archive::new(reader);
        for entry in archive.entries().context("read tar entries")? {
            let mut entry = entry.context("read tar header")?;
            self.add_entry(&mut entry)?;
        }
        Ok(())
    }

    fn add_entry(&mut self, entry: &mut tar::Entry<'_, impl Read>) -> Result<()> {
        let header_type = entry.header().entry_type();
        if matches!(
            header_type,
            EntryType::XGlobalHeader
                | EntryType::XHeader
                | EntryType::GNULongName
                | EntryType::GNULongLink
        ) {
            return Ok(());
        }
        let path = entry.path_bytes().into_owned();
        let components: Vec<Vec<u8>> = path
            .split(|&b| b == b'/')
            .filter(|part| !part.is_empty() && **part != *b".")
            .map(<[u8]>::to_vec)
            .collect();
        if components.iter().any(|part| part == b"..") {
            warn!("skipping archive member with \"..\" in its path");
            return Ok(());
        }
        debug!("tar entry {}", String::from_utf8_lossy(&path));

        let keyvals = self.entry_keyvals(entry)?;
        let mut node = &mut self.root;
        for part in &components {
            node = node.child_mut(part);
        }
        node.keyvals = keyvals;
        Ok(())
    }

    /// Computes the requested keyvals from one header, draining the entry's
    /// content through the hash contexts exactly once.
    fn entry_keyvals(&self, entry: &mut tar::Entry<'_, impl Read>) -> Result<Vec<KeyVal>> {
        let header = entry.header().clone();
        let entry_type = header.entry_type();
        let is_regular = matches!(entry_type, EntryType::Regular | EntryType::Continuous);

        let mut xattrs = Vec::new();
        if self.keywords.contains(&Keyword::Xattr(String::new())) {
            if let Some(extensions) = entry.pax_extensions().context("read pax extensions")? {
                for extension in extensions {
                    let extension = extension.context("read pax extension")?;
                    let Ok(key) = extension.key() else { continue };
                    if let Some(name) = key.strip_prefix("SCHILY.xattr.") {
                        xattrs.push(KeyVal::new(
                            Keyword::Xattr(name.to_owned()),
                            BASE64.encode(extension.value_bytes()),
                        ));
                    }
                }
            }
        }

        let mut hashers: Vec<ContentHasher> = if is_regular {
            self.keywords
                .iter()
                .filter(|&keyword| needs_content(keyword))
                .filter_map(ContentHasher::new)
                .collect()
        } else {
            Vec::new()
        };
        let mut buf = [0u8; 64 * 1024];
        loop {
            let n = entry.read(&mut buf).context("read tar content")?;
            if n == 0 {
                break;
            }
            for hasher in &mut hashers {
                hasher.write(&buf[..n]);
            }
        }
        let mut digests: Vec<KeyVal> = hashers.into_iter().map(ContentHasher::finish).collect();

        let mut keyvals = Vec::new();
        for keyword in &self.keywords {
            match keyword {
                Keyword::Size => {
                    let size = if is_regular { header.size()? } else { 0 };
                    keyvals.push(KeyVal::new(Keyword::Size, size.to_string()));
                }
                Keyword::Type => {
                    keyvals.push(KeyVal::new(Keyword::Type, tar_type_name(entry_type)));
                }
                Keyword::Uid => keyvals.push(KeyVal::new(Keyword::Uid, header.uid()?.to_string())),
                Keyword::Gid => keyvals.push(KeyVal::new(Keyword::Gid, header.gid()?.to_string())),
                Keyword::Mode => {
                    keyvals.push(KeyVal::new(Keyword::Mode, format_mode(header.mode()?)))
                }
                Keyword::Link => {
                    // Symlink targets and hardlink targets both land here.
                    if let Some(target) = entry.link_name_bytes() {
                        keyvals.push(KeyVal::new(Keyword::Link, vis_token(&target)));
                    }
                }
                Keyword::Time => {
                    keyvals.push(KeyVal::new(
                        Keyword::Time,
                        format!("{}.000000000", header.mtime()?),
                    ));
                }
                Keyword::TarTime => {
                    keyvals.push(KeyVal::new(
                        Keyword::TarTime,
                        format!("{}.000000000", header.mtime()?),
                    ));
                }
                Keyword::Uname => {
                    if let Ok(Some(name)) = header.username() {
                        keyvals.push(KeyVal::new(Keyword::Uname, vis_token(name.as_bytes())));
                    }
                }
                Keyword::Gname => {
                    if let Ok(Some(name)) = header.groupname() {
                        keyvals.push(KeyVal::new(Keyword::Gname, vis_token(name.as_bytes())));
                    }
                }
                Keyword::Flags => keyvals.push(KeyVal::new(Keyword::Flags, "none")),
                Keyword::Xattr(suffix) if suffix.is_empty() => {
                    keyvals.append(&mut xattrs.clone());
                }
                keyword if needs_content(keyword) => {
                    if let Some(index) = digests.iter().position(|kv| kv.keyword() == keyword) {
                        keyvals.push(digests.remove(index));
                    }
                }
                // nlink and the rest cannot be derived from an archive.
                _ => (),
            }
        }
        Ok(keyvals)
    }

    /// Lays the accumulated tree out as manifest entries.
    pub fn hierarchy(self) -> DirectoryHierarchy {
        let mut dh = DirectoryHierarchy::default();
        let frame = select(&default_tar_set_keyvals(), &self.keywords);
        let frame_index = if frame.is_empty() {
            None
        } else {
            Some(dh.push_set_frame(frame.clone()))
        };
        let mut layout = Layout {
            dh,
            frame,
            frame_index,
        };
        layout.visit(&self.root, PathBuf::from("."), None);
        layout.dh
    }
}

struct Layout {
    dh: DirectoryHierarchy,
    frame: Vec<KeyVal>,
    frame_index: Option<usize>,
}

impl Layout {
    fn visit(&mut self, node: &Node, rel: PathBuf, parent: Option<usize>) {
        let is_root = parent.is_none();
        if !is_root {
            let pos = self.dh.entries().len();
            self.dh.push(Entry::blank(pos));
        }
        let pos = self.dh.entries().len();
        let comment = format!("# {}", vis_token(rel.as_os_str().as_bytes()));
        self.dh.push(Entry::comment(pos, comment));
        if is_root {
            if !self.frame.is_empty() {
                let pos = self.dh.entries().len();
                self.dh.push(Entry::special(pos, "/set", self.frame.clone()));
            }
        }
        let pos = self.dh.entries().len();
        let dir_index = self.dh.push(Entry {
            kind: EntryKind::Relative,
            pos,
            raw: String::new(),
            name: node.name.clone(),
            keyvals: elide(&node.keyvals, &self.frame),
            parent,
            set: self.frame_index,
        });
        for child in &node.children {
            if is_dir_node(child) {
                self.visit(child, rel.join(&child.name), Some(dir_index));
            } else {
                let pos = self.dh.entries().len();
                self.dh.push(Entry {
                    kind: EntryKind::Relative,
                    pos,
                    raw: String::new(),
                    name: child.name.clone(),
                    keyvals: elide(&child.keyvals, &self.frame),
                    parent: Some(dir_index),
                    set: self.frame_index,
                });
            }
        }
        if !is_root {
            let pos = self.dh.entries().len();
            self.dh.push(Entry::dot_dot(pos));
        }
    }
}

fn is_dir_node(node: &Node) -> bool {
    find(&node.keyvals, &Keyword::Type).map(|kv| kv.value()) == Some("dir")
        || !node.children.is_empty()
}

fn tar_type_name(entry_type: EntryType) -> &'static str {
    match entry_type {
        EntryType::Directory => "dir",
        EntryType::Symlink => "link",
        EntryType::Char => "char",
        EntryType::Block => "block",
        EntryType::Fifo => "fifo",
        // Hardlinks read back as regular files.
        _ => "file",
    }
}

fn default_tar_set_keyvals() -> Vec<KeyVal> {
    vec![
        KeyVal::new(Keyword::Type, "file"),
        KeyVal::new(Keyword::Flags, "none"),
        KeyVal::new(Keyword::Mode, "0664"),
    ]
}

fn elide(keyvals: &[KeyVal], frame: &[KeyVal]) -> Vec<KeyVal> {
    keyvals
        .iter()
        .filter(|kv| find(frame, kv.keyword()) != Some(kv))
        .cloned()
        .collect()
}
