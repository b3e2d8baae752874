//! The compute side of the keyword registry: derive a keyword's value from
//! a live filesystem object.

use std::fs::Metadata;
use std::io::Read;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::{FileTypeExt, MetadataExt};
use std::path::Path;
use std::sync::OnceLock;

use anyhow::{Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use md5::Md5;
use ripemd::Ripemd160;
use sha1::Sha1;
use sha2::{Digest, Sha256, Sha384, Sha512};

use crate::vis::vis_token;

use super::{KeyVal, Keyword};

/// Whether computing this keyword requires reading file content.
pub fn needs_content(keyword: &Keyword) -> bool {
    matches!(keyword, Keyword::Cksum) || keyword.is_digest()
}

/// Computes the keyvals for one keyword on one filesystem object.
///
/// `content` must be supplied for content keywords on regular files and may
/// be `None` otherwise; content keywords yield nothing without it. Most
/// keywords produce exactly one keyval; the `xattr` family produces one per
/// attribute present, and keywords that do not apply to the object produce
/// none.
pub fn compute(
    keyword: &Keyword,
    path: &Path,
    meta: &Metadata,
    content: Option<&mut dyn Read>,
) -> Result<Vec<KeyVal>> {
    let one = |value: String| vec![KeyVal::new(keyword.clone(), value)];
    Ok(match keyword {
        Keyword::Size => {
            let size = if meta.is_file() { meta.len() } else { 0 };
            one(size.to_string())
        }
        Keyword::Type => one(type_name(meta).to_owned()),
        Keyword::Uid => one(meta.uid().to_string()),
        Keyword::Gid => one(meta.gid().to_string()),
        Keyword::Mode => one(format_mode(meta.mode())),
        Keyword::Nlink => one(meta.nlink().to_string()),
        Keyword::Link => {
            if meta.file_type().is_symlink() {
                let target = std::fs::read_link(path)
                    .with_context(|| format!("readlink {}", path.display()))?;
                one(vis_token(target.as_os_str().as_bytes()))
            } else {
                vec![]
            }
        }
        Keyword::Time => one(format!("{}.{:09}", meta.mtime(), meta.mtime_nsec())),
        Keyword::TarTime => one(format!("{}.000000000", meta.mtime())),
        Keyword::Cksum => match content {
            Some(reader) => one(bsd_cksum(reader)?.to_string()),
            None => vec![],
        },
        Keyword::Md5
        | Keyword::Sha1
        | Keyword::Sha256
        | Keyword::Sha384
        | Keyword::Sha512
        | Keyword::Rmd160 => match content {
            Some(reader) => {
                let mut hasher =
                    ContentHasher::new(keyword).expect("digest keyword has a hasher");
                let mut buf = [0u8; 64 * 1024];
                loop {
                    let n = reader
                        .read(&mut buf)
                        .with_context(|| format!("read {}", path.display()))?;
                    if n == 0 {
                        break;
                    }
                    hasher.write(&buf[..n]);
                }
                vec![hasher.finish()]
            }
            None => vec![],
        },
        // Linux has no BSD file flags.
        Keyword::Flags => one("none".to_owned()),
        Keyword::Device => {
            let ft = meta.file_type();
            if ft.is_block_device() || ft.is_char_device() {
                let dev = meta.rdev();
                one(format!(
                    "native,{},{}",
                    nix::sys::stat::major(dev),
                    nix::sys::stat::minor(dev)
                ))
            } else {
                vec![]
            }
        }
        Keyword::Uname => match users::get_user_by_uid(meta.uid()) {
            Some(user) => one(vis_token(user.name().as_bytes())),
            None => {
                tracing::debug!(uid = meta.uid(), "no passwd entry; skipping uname");
                vec![]
            }
        },
        Keyword::Gname => match users::get_group_by_gid(meta.gid()) {
            Some(group) => one(vis_token(group.name().as_bytes())),
            None => {
                tracing::debug!(gid = meta.gid(), "no group entry; skipping gname");
                vec![]
            }
        },
        Keyword::Xattr(suffix) if suffix.is_empty() => {
            let mut out = Vec::new();
            let names =
                xattr::list(path).with_context(|| format!("listxattr {}", path.display()))?;
            for name in names {
                let Some(value) = xattr::get(path, &name)? else {
                    continue;
                };
                let suffix = name.to_string_lossy().into_owned();
                out.push(KeyVal::new(Keyword::Xattr(suffix), BASE64.encode(value)));
            }
            out
        }
        Keyword::Xattr(suffix) => match xattr::get(path, suffix)? {
            Some(value) => one(BASE64.encode(value)),
            None => vec![],
        },
        // Directives and foreign keywords carry no computed value.
        Keyword::Ignore
        | Keyword::Optional
        | Keyword::Nochange
        | Keyword::Tags
        | Keyword::Other(_) => vec![],
    })
}

/// The manifest `type` value for a filesystem object.
pub fn type_name(meta: &Metadata) -> &'static str {
    let ft = meta.file_type();
    if ft.is_symlink() {
        "link"
    } else if ft.is_dir() {
        "dir"
    } else if ft.is_block_device() {
        "block"
    } else if ft.is_char_device() {
        "char"
    } else if ft.is_fifo() {
        "fifo"
    } else if ft.is_socket() {
        "socket"
    } else {
        "file"
    }
}

/// Formats permission bits the way mtree prints them: a leading zero and
/// the suid/sgid/sticky bits included.
pub fn format_mode(mode: u32) -> String {
    let bits = mode & 0o7777;
    if bits == 0 {
        "0".to_owned()
    } else {
        format!("0{:o}", bits)
    }
}

/// An incremental hash context for one content keyword. Used wherever
/// content arrives as a stream rather than a file on disk.
pub enum ContentHasher {
    Cksum { crc: u32, len: u64 },
    Md5(Md5),
    Sha1(Sha1),
    Sha256(Sha256),
    Sha384(Sha384),
    Sha512(Sha512),
    Rmd160(Ripemd160),
}

impl ContentHasher {
    /// A hasher for the given keyword, or `None` when the keyword is not a
    /// content keyword.
    pub fn new(keyword: &Keyword) -> Option<Self> {
        Some(match keyword {
            Keyword::Cksum => ContentHasher::Cksum { crc: 0, len: 0 },
            Keyword::Md5 => ContentHasher::Md5(Md5::new()),
            Keyword::Sha1 => ContentHasher::Sha1(Sha1::new()),
            Keyword::Sha256 => ContentHasher::Sha256(Sha256::new()),
            Keyword::Sha384 => ContentHasher::Sha384(Sha384::new()),
            Keyword::Sha512 => ContentHasher::Sha512(Sha512::new()),
            Keyword::Rmd160 => ContentHasher::Rmd160(Ripemd160::new()),
            _ => return None,
        })
    }

    pub fn write(&mut self, data: &[u8]) {
        match self {
            ContentHasher::Cksum { crc, len } => {
                for &b in data {
                    *crc = crc_step(*crc, b);
                }
                *len += data.len() as u64;
            }
            ContentHasher::Md5(h) => h.update(data),
            ContentHasher::Sha1(h) => h.update(data),
            ContentHasher::Sha256(h) => h.update(data),
            ContentHasher::Sha384(h) => h.update(data),
            ContentHasher::Sha512(h) => h.update(data),
            ContentHasher::Rmd160(h) => h.update(data),
        }
    }

    pub fn finish(self) -> KeyVal {
        match self {
            ContentHasher::Cksum { crc, len } => {
                KeyVal::new(Keyword::Cksum, cksum_finish(crc, len).to_string())
            }
            ContentHasher::Md5(h) => KeyVal::new(Keyword::Md5, hex::encode(h.finalize())),
            ContentHasher::Sha1(h) => KeyVal::new(Keyword::Sha1, hex::encode(h.finalize())),
            ContentHasher::Sha256(h) => KeyVal::new(Keyword::Sha256, hex::encode(h.finalize())),
            ContentHasher::Sha384(h) => KeyVal::new(Keyword::Sha384, hex::encode(h.finalize())),
            ContentHasher::Sha512(h) => KeyVal::new(Keyword::Sha512, hex::encode(h.finalize())),
            ContentHasher::Rmd160(h) => KeyVal::new(Keyword::Rmd160, hex::encode(h.finalize())),
        }
    }
}

/// The historic POSIX `cksum` CRC over a reader.
fn bsd_cksum(reader: &mut dyn Read) -> Result<u32> {
    let mut crc = 0u32;
    let mut len = 0u64;
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        for &b in &buf[..n] {
            crc = crc_step(crc, b);
        }
        len += n as u64;
    }
    Ok(cksum_finish(crc, len))
}

fn crc_table() -> &'static [u32; 256] {
    static TABLE: OnceLock<[u32; 256]> = OnceLock::new();
    TABLE.get_or_init(|| {
        let mut table = [0u32; 256];
        for (i, slot) in table.iter_mut().enumerate() {
            let mut c = (i as u32) << 24;
            for _ in 0..8 {
                c = if c & 0x8000_0000 != 0 {
                    (c << 1) ^ 0x04c1_1db7
                } else {
                    c << 1
                };
            }
            *slot = c;
        }
        table
    })
}

fn crc_step(crc: u32, byte: u8) -> u32 {
    (crc << 8) ^ crc_table()[(((crc >> 24) ^ byte as u32) & 0xff) as usize]
}

/// Appends the message length, least-significant byte first with trailing
/// zero octets omitted, then complements.
fn cksum_finish(mut crc: u32, mut len: u64) -> u32 {
    while len != 0 {
        crc = crc_step(crc, (len & 0xff) as u8);
        len >>= 8;
    }
    !crc
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;

    #[test]
    fn cksum_of_empty_input() {
        assert_eq!(bsd_cksum(&mut Cursor::new(b"")).unwrap(), 4294967295);
    }

    #[test]
    fn cksum_is_stable_and_content_sensitive() {
        let a = bsd_cksum(&mut Cursor::new(b"hello\n")).unwrap();
        let b = bsd_cksum(&mut Cursor::new(b"hello\n")).unwrap();
        let c = bsd_cksum(&mut Cursor::new(b"hello!")).unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn cksum_length_postfix_matters() {
        // Same CRC prefix, different lengths must differ.
        let a = bsd_cksum(&mut Cursor::new(&[0u8; 1][..])).unwrap();
        let b = bsd_cksum(&mut Cursor::new(&[0u8; 2][..])).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn sha256_of_empty_input() {
        let mut hasher = ContentHasher::new(&Keyword::Sha256).unwrap();
        hasher.write(b"");
        assert_eq!(
            hasher.finish().value(),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn mode_formatting() {
        assert_eq!(format_mode(0o644), "0644");
        assert_eq!(format_mode(0o4755), "04755");
        assert_eq!(format_mode(0o100644), "0644");
        assert_eq!(format_mode(0), "0");
    }
}
