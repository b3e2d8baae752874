//! The update side of the keyword registry: apply a manifest value back to
//! the filesystem.

use std::os::unix::ffi::OsStringExt;
use std::path::Path;

use anyhow::{bail, Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use nix::sys::stat::{fchmodat, utimensat, FchmodatFlags, Mode, UtimensatFlags};
use nix::sys::time::TimeSpec;
use nix::unistd::{fchownat, FchownatFlags, Gid, Uid};

use crate::vis::unvis_token;

use super::Keyword;

/// Whether the updater knows how to apply this keyword.
pub fn has_update(keyword: &Keyword) -> bool {
    matches!(
        keyword,
        Keyword::Uid
            | Keyword::Gid
            | Keyword::Uname
            | Keyword::Gname
            | Keyword::Mode
            | Keyword::Time
            | Keyword::TarTime
            | Keyword::Xattr(_)
    )
}

/// Applies one manifest value to the object at `path`, returning the value
/// as applied so callers can round-trip it.
///
/// Ownership and timestamps are applied to symlinks themselves; permission
/// bits skip symlinks, which carry none worth setting on this platform.
pub fn update(keyword: &Keyword, path: &Path, value: &str) -> Result<String> {
    match keyword {
        Keyword::Uid => {
            let uid: u32 = value.parse().with_context(|| format!("bad uid {value:?}"))?;
            chown_at(path, Some(Uid::from_raw(uid)), None)?;
        }
        Keyword::Gid => {
            let gid: u32 = value.parse().with_context(|| format!("bad gid {value:?}"))?;
            chown_at(path, None, Some(Gid::from_raw(gid)))?;
        }
        Keyword::Uname => {
            let name = decoded_name(value)?;
            let user = users::get_user_by_name(&name)
                .with_context(|| format!("no such user {:?}", name))?;
            chown_at(path, Some(Uid::from_raw(user.uid())), None)?;
        }
        Keyword::Gname => {
            let name = decoded_name(value)?;
            let group = users::get_group_by_name(&name)
                .with_context(|| format!("no such group {:?}", name))?;
            chown_at(path, None, Some(Gid::from_raw(group.gid())))?;
        }
        Keyword::Mode => {
            let meta = std::fs::symlink_metadata(path)
                .with_context(|| format!("lstat {}", path.display()))?;
            if meta.file_type().is_symlink() {
                return Ok(value.to_owned());
            }
            let bits = u32::from_str_radix(value, 8)
                .with_context(|| format!("bad mode {value:?}"))?;
            fchmodat(
                None,
                path,
                Mode::from_bits_truncate(bits),
                FchmodatFlags::FollowSymlink,
            )
            .with_context(|| format!("chmod {}", path.display()))?;
        }
        Keyword::Time | Keyword::TarTime => {
            let (secs, nanos) = parse_time(value)?;
            let ts = TimeSpec::new(secs, nanos);
            utimensat(None, path, &ts, &ts, UtimensatFlags::NoFollowSymlink)
                .with_context(|| format!("utimensat {}", path.display()))?;
        }
        Keyword::Xattr(suffix) if !suffix.is_empty() => {
            let bytes = BASE64
                .decode(value)
                .with_context(|| format!("bad base64 for xattr.{suffix}"))?;
            xattr::set(path, suffix, &bytes)
                .with_context(|| format!("setxattr {} on {}", suffix, path.display()))?;
        }
        _ => bail!("keyword {keyword} cannot be applied"),
    }
    Ok(value.to_owned())
}

fn chown_at(path: &Path, owner: Option<Uid>, group: Option<Gid>) -> Result<()> {
    fchownat(None, path, owner, group, FchownatFlags::NoFollowSymlink)
        .with_context(|| format!("chown {}", path.display()))
}

fn decoded_name(value: &str) -> Result<std::ffi::OsString> {
    let bytes = unvis_token(value).with_context(|| format!("bad encoding in {value:?}"))?;
    Ok(std::ffi::OsString::from_vec(bytes))
}

/// Parses a `<seconds>.<nanoseconds>` timestamp.
fn parse_time(value: &str) -> Result<(i64, i64)> {
    let (secs, nanos) = match value.split_once('.') {
        Some((secs, nanos)) => (secs, nanos),
        None => (value, "0"),
    };
    let secs: i64 = secs
        .parse()
        .with_context(|| format!("bad timestamp {value:?}"))?;
    let nanos: i64 = nanos
        .parse()
        .with_context(|| format!("bad timestamp {value:?}"))?;
    if !(0..1_000_000_000).contains(&nanos) {
        bail!("bad nanoseconds in timestamp {value:?}");
    }
    Ok((secs, nanos))
}
