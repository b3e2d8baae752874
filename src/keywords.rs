//! Keywords: the per-property vocabulary of a manifest.
//!
//! A [`Keyword`] names one recorded property of a filesystem object, a
//! [`KeyVal`] pairs it with its vis-encoded textual value. The closed set of
//! keywords is a plain enum with a total match in the compute and update
//! registries; the open-ended `xattr.<namespace>.<name>` family carries its
//! suffix, and keywords this tool does not know are preserved verbatim as
//! [`Keyword::Other`] so foreign manifests survive a round trip.

use std::fmt;
use std::str::FromStr;

use anyhow::{anyhow, bail};

pub mod compute;
pub mod update;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Keyword {
    Size,
    Type,
    Uid,
    Gid,
    Mode,
    Nlink,
    Link,
    Time,
    TarTime,
    Cksum,
    Md5,
    Sha1,
    Sha256,
    Sha384,
    Sha512,
    Rmd160,
    Flags,
    Device,
    Ignore,
    Optional,
    Nochange,
    Tags,
    Gname,
    Uname,
    /// An `xattr.<namespace>.<name>` keyword; the suffix is everything after
    /// the first dot. An empty suffix requests the whole family.
    Xattr(String),
    /// A well-formed keyword this tool does not recognise.
    Other(String),
}

/// Keywords produced by default when walking a live tree.
pub const DEFAULT_KEYWORDS: [Keyword; 8] = [
    Keyword::Size,
    Keyword::Type,
    Keyword::Uid,
    Keyword::Gid,
    Keyword::Mode,
    Keyword::Link,
    Keyword::Nlink,
    Keyword::Time,
];

/// Keywords produced by default when streaming a tar archive. Hardlink
/// counts cannot be derived from an archive, and tar timestamps carry no
/// sub-second precision.
pub const DEFAULT_TAR_KEYWORDS: [Keyword; 7] = [
    Keyword::Size,
    Keyword::Type,
    Keyword::Uid,
    Keyword::Gid,
    Keyword::Mode,
    Keyword::Link,
    Keyword::TarTime,
];

/// Keywords seeded into the walker's initial `/set` frame.
pub const SET_KEYWORDS: [Keyword; 2] = [Keyword::Uid, Keyword::Gid];

/// Keywords applied by the updater when the caller does not choose.
pub const DEFAULT_UPDATE_KEYWORDS: [Keyword; 4] =
    [Keyword::Uid, Keyword::Gid, Keyword::Mode, Keyword::Time];

impl Keyword {
    /// The canonical manifest spelling.
    pub fn name(&self) -> String {
        match self {
            Keyword::Size => "size".into(),
            Keyword::Type => "type".into(),
            Keyword::Uid => "uid".into(),
            Keyword::Gid => "gid".into(),
            Keyword::Mode => "mode".into(),
            Keyword::Nlink => "nlink".into(),
            Keyword::Link => "link".into(),
            Keyword::Time => "time".into(),
            Keyword::TarTime => "tar_time".into(),
            Keyword::Cksum => "cksum".into(),
            Keyword::Md5 => "md5digest".into(),
            Keyword::Sha1 => "sha1digest".into(),
            Keyword::Sha256 => "sha256digest".into(),
            Keyword::Sha384 => "sha384digest".into(),
            Keyword::Sha512 => "sha512digest".into(),
            Keyword::Rmd160 => "ripemd160digest".into(),
            Keyword::Flags => "flags".into(),
            Keyword::Device => "device".into(),
            Keyword::Ignore => "ignore".into(),
            Keyword::Optional => "optional".into(),
            Keyword::Nochange => "nochange".into(),
            Keyword::Tags => "tags".into(),
            Keyword::Gname => "gname".into(),
            Keyword::Uname => "uname".into(),
            Keyword::Xattr(suffix) if suffix.is_empty() => "xattr".into(),
            Keyword::Xattr(suffix) => format!("xattr.{suffix}"),
            Keyword::Other(name) => name.clone(),
        }
    }

    /// Whether this keyword is in the default walk set.
    pub fn is_default(&self) -> bool {
        DEFAULT_KEYWORDS.contains(self)
    }

    /// Whether upstream FreeBSD `mtree(8)` recognises this keyword.
    pub fn is_bsd(&self) -> bool {
        matches!(
            self,
            Keyword::Cksum
                | Keyword::Device
                | Keyword::Flags
                | Keyword::Ignore
                | Keyword::Gid
                | Keyword::Gname
                | Keyword::Link
                | Keyword::Md5
                | Keyword::Mode
                | Keyword::Nlink
                | Keyword::Nochange
                | Keyword::Optional
                | Keyword::Rmd160
                | Keyword::Sha1
                | Keyword::Sha256
                | Keyword::Sha384
                | Keyword::Sha512
                | Keyword::Size
                | Keyword::Tags
                | Keyword::Time
                | Keyword::Type
                | Keyword::Uid
                | Keyword::Uname
        )
    }

    /// Checker directives: consulted for policy, never compared as values.
    pub fn is_directive(&self) -> bool {
        matches!(
            self,
            Keyword::Ignore | Keyword::Optional | Keyword::Nochange | Keyword::Tags
        )
    }

    /// Whether the value is a content digest in hex.
    pub fn is_digest(&self) -> bool {
        matches!(
            self,
            Keyword::Md5
                | Keyword::Sha1
                | Keyword::Sha256
                | Keyword::Sha384
                | Keyword::Sha512
                | Keyword::Rmd160
        )
    }

    /// Whether a value for this keyword can be computed from a live object
    /// and therefore compared by the checker.
    pub fn is_comparable(&self) -> bool {
        !self.is_directive() && !matches!(self, Keyword::Other(_))
    }

    /// Every keyword this tool can compute. The `xattr` family is
    /// represented by its family request.
    pub fn known() -> Vec<Keyword> {
        vec![
            Keyword::Size,
            Keyword::Type,
            Keyword::Uid,
            Keyword::Gid,
            Keyword::Mode,
            Keyword::Nlink,
            Keyword::Link,
            Keyword::Time,
            Keyword::TarTime,
            Keyword::Cksum,
            Keyword::Md5,
            Keyword::Sha1,
            Keyword::Sha256,
            Keyword::Sha384,
            Keyword::Sha512,
            Keyword::Rmd160,
            Keyword::Flags,
            Keyword::Device,
            Keyword::Ignore,
            Keyword::Optional,
            Keyword::Nochange,
            Keyword::Tags,
            Keyword::Gname,
            Keyword::Uname,
            Keyword::Xattr(String::new()),
        ]
    }
}

impl FromStr for Keyword {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            bail!("empty keyword");
        }
        if !s
            .bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'.' || b == b'_')
        {
            bail!("malformed keyword {s:?}");
        }
        Ok(match s {
            "size" => Keyword::Size,
            "type" => Keyword::Type,
            "uid" => Keyword::Uid,
            "gid" => Keyword::Gid,
            "mode" => Keyword::Mode,
            "nlink" => Keyword::Nlink,
            "link" => Keyword::Link,
            "time" => Keyword::Time,
            "tar_time" => Keyword::TarTime,
            "cksum" => Keyword::Cksum,
            "md5" | "md5digest" => Keyword::Md5,
            "sha1" | "sha1digest" => Keyword::Sha1,
            "sha256" | "sha256digest" => Keyword::Sha256,
            "sha384" | "sha384digest" => Keyword::Sha384,
            "sha512" | "sha512digest" => Keyword::Sha512,
            "rmd160" | "rmd160digest" | "ripemd160digest" => Keyword::Rmd160,
            "flags" => Keyword::Flags,
            "device" => Keyword::Device,
            "ignore" => Keyword::Ignore,
            "optional" => Keyword::Optional,
            "nochange" => Keyword::Nochange,
            "tags" => Keyword::Tags,
            "gname" => Keyword::Gname,
            "uname" => Keyword::Uname,
            "xattr" => Keyword::Xattr(String::new()),
            _ => match s.split_once('.') {
                Some(("xattr", suffix)) => Keyword::Xattr(suffix.to_owned()),
                _ => Keyword::Other(s.to_owned()),
            },
        })
    }
}

impl fmt::Display for Keyword {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name())
    }
}

/// A `keyword=value` pair. Directive keywords may carry no value at all.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyVal {
    keyword: Keyword,
    value: Option<String>,
}

impl KeyVal {
    pub fn new(keyword: Keyword, value: impl Into<String>) -> Self {
        KeyVal {
            keyword,
            value: Some(value.into()),
        }
    }

    /// A value-less keyword such as `optional`.
    pub fn bare(keyword: Keyword) -> Self {
        KeyVal {
            keyword,
            value: None,
        }
    }

    /// Parses one `keyword[=value]` manifest token.
    pub fn parse(token: &str) -> anyhow::Result<Self> {
        let (name, value) = match token.split_once('=') {
            Some((name, value)) => (name, Some(value.to_owned())),
            None => (token, None),
        };
        let keyword = name
            .parse()
            .map_err(|e| anyhow!("bad keyword in token {token:?}: {e}"))?;
        Ok(KeyVal { keyword, value })
    }

    pub fn keyword(&self) -> &Keyword {
        &self.keyword
    }

    /// The vis-encoded value text; empty for a bare keyword.
    pub fn value(&self) -> &str {
        self.value.as_deref().unwrap_or("")
    }

    /// The same keyword with a different value.
    pub fn with_value(&self, value: impl Into<String>) -> Self {
        KeyVal {
            keyword: self.keyword.clone(),
            value: Some(value.into()),
        }
    }
}

impl fmt::Display for KeyVal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.value {
            Some(value) => write!(f, "{}={}", self.keyword, value),
            None => write!(f, "{}", self.keyword),
        }
    }
}

/// Finds a keyword in a keyval list.
pub fn find<'a>(keyvals: &'a [KeyVal], keyword: &Keyword) -> Option<&'a KeyVal> {
    keyvals.iter().find(|kv| kv.keyword() == keyword)
}

/// Restricts a keyval list to the given keywords, preserving order.
pub fn select(keyvals: &[KeyVal], keywords: &[Keyword]) -> Vec<KeyVal> {
    keyvals
        .iter()
        .filter(|kv| keywords.contains(kv.keyword()))
        .cloned()
        .collect()
}

/// Merges an active `/set` frame with an entry's own keyvals.
///
/// The frame's order is preserved; an entry value replaces the frame's value
/// for a shared keyword in place, and entry-only keywords are appended.
/// Duplicates within either list resolve to the last occurrence.
pub fn merge_set(set: &[KeyVal], entry: &[KeyVal]) -> Vec<KeyVal> {
    let mut merged: Vec<KeyVal> = Vec::with_capacity(set.len() + entry.len());
    for kv in set.iter().chain(entry) {
        match merged.iter_mut().find(|m| m.keyword() == kv.keyword()) {
            Some(slot) => *slot = kv.clone(),
            None => merged.push(kv.clone()),
        }
    }
    merged
}
