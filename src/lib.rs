//! Directory hierarchy manifests in the BSD `mtree(8)` format.
//!
//! A manifest is an ordered, line-oriented description of a filesystem
//! tree: one entry per object, each carrying `keyword=value` pairs for the
//! properties it records, with `/set` and `/unset` directives providing
//! inherited defaults. This crate can:
//!
//! * build a manifest from a live tree ([`walk`]) or from a streaming tar
//!   archive ([`tar`]),
//! * parse ([`parse`]) and emit ([`DirectoryHierarchy::write_to`]) the
//!   textual format, round-trip clean,
//! * diff a tree or an archive against a manifest ([`check`]), and
//! * push manifest values back onto a tree ([`update`]).
//!
//! Paths and values are escaped with a BSD `vis(3)`-compatible codec
//! ([`vis`]), so arbitrary bytes survive the textual form.
//!
//! ```no_run
//! use treespec::{keywords::DEFAULT_KEYWORDS, walk, check};
//!
//! let manifest = walk::walk("/some/tree", &DEFAULT_KEYWORDS)?;
//! let result = check::check("/some/tree", &manifest, None, None)?;
//! assert!(result.is_clean());
//! # Ok::<(), anyhow::Error>(())
//! ```

pub mod cancel;
pub mod check;
pub mod hierarchy;
pub mod keywords;
pub mod parse;
pub mod tar;
pub mod update;
pub mod vis;
pub mod walk;

pub use cancel::CancelFlag;
pub use check::{check, compare, tar_check, CheckResult, Failure};
pub use hierarchy::{DirectoryHierarchy, Entry, EntryKind};
pub use keywords::{KeyVal, Keyword};
pub use parse::{parse_manifest, ParseError};
pub use update::update;
pub use walk::{walk, Walker};
