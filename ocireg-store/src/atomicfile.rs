//! Atomic write-then-rename primitives for the local blob and manifest
//! store: write to a `_tmp` sibling, then either rename it into place or
//! unlink it, never leaving a half-written file visible under its real name.
//!
//! `BlobKey` is a `sha256:<hex>` digest turned into a two-level `algo/hex`
//! path so a directory never holds more than one level's worth of entries.
//! All path components are validated against `.`/`/` so a malformed digest
//! can't escape the store directory even before `ResolveFlags::BENEATH`
//! would catch it.

use log::error;
use rustix::{
    fd::OwnedFd,
    fs::{AtFlags, Mode, OFlags, ResolveFlags},
    io::Errno,
};

use ocireg_core::Digest;

#[derive(Hash, Eq, PartialEq, Clone)]
pub struct BlobKey(String);

impl BlobKey {
    pub fn new(s: String) -> Option<Self> {
        if s.contains('.') || s.contains('/') {
            return None;
        }
        match s.split_once(':') {
            Some((l, r)) if l.is_empty() || r.is_empty() => None,
            None => None,
            _ => Some(Self(s)),
        }
    }

    fn as_path(&self) -> String {
        self.0.replacen(':', "/", 1)
    }

    fn parts(&self) -> (&str, &str) {
        self.0.split_once(':').unwrap()
    }

    fn with_tmp_suffix(&self) -> Self {
        Self(format!("{}_tmp", self.0))
    }
}

impl TryFrom<&Digest> for BlobKey {
    type Error = ();
    fn try_from(digest: &Digest) -> Result<Self, Self::Error> {
        Self::new(digest.to_string()).ok_or(())
    }
}

impl std::fmt::Display for BlobKey {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

pub struct FileGuard<'a> {
    dir: &'a OwnedFd,
    key: Option<&'a BlobKey>,
}

impl<'a> FileGuard<'a> {
    fn new(dir: &'a OwnedFd, key: &'a BlobKey) -> FileGuard<'a> {
        Self {
            dir,
            key: Some(key),
        }
    }

    pub fn success(mut self) -> Result<(), Errno> {
        if let Some(key) = self.key.take() {
            rustix::fs::renameat(
                &self.dir,
                key.with_tmp_suffix().as_path(),
                &self.dir,
                key.as_path(),
            )?;
        }
        Ok(())
    }
}

impl Drop for FileGuard<'_> {
    fn drop(&mut self) {
        if let Some(key) = self.key.take() {
            match unlinkat(self.dir, &key.with_tmp_suffix()) {
                Ok(()) => {}
                Err(e) => {
                    error!("error dropping FileGuard, deleting {} failed: {:?}", key, e);
                }
            }
        }
    }
}

pub fn openat_create_write_with_guard<'a>(
    dir: &'a OwnedFd,
    key: &'a BlobKey,
) -> Result<(std::fs::File, FileGuard<'a>), Errno> {
    let file = openat_create_write(dir, &key.with_tmp_suffix())?;
    let guard = FileGuard::new(dir, key);
    Ok((file, guard))
}

pub fn openat_read(
    dir: &OwnedFd,
    name: impl rustix::path::Arg,
) -> Result<Option<std::fs::File>, Errno> {
    match rustix::fs::openat2(
        dir,
        name,
        OFlags::RDONLY | OFlags::CLOEXEC,
        Mode::empty(),
        ResolveFlags::BENEATH,
    ) {
        Ok(f) => Ok(Some(f.into())),
        Err(e) if e == Errno::NOENT => Ok(None),
        Err(e) => Err(e),
    }
}

pub fn openat_read_key(dir: &OwnedFd, key: &BlobKey) -> Result<Option<std::fs::File>, Errno> {
    openat_read(dir, key.as_path())
}

pub fn open_or_create_dir_at(
    dir: Option<&OwnedFd>,
    path: impl rustix::path::Arg + Copy,
) -> Result<OwnedFd, Errno> {
    if let Some(dir) = dir {
        match rustix::fs::mkdirat(dir, path, Mode::from_bits_truncate(0o744)) {
            Ok(_) => Ok(()),
            Err(e) if e == Errno::EXIST => Ok(()),
            e => e,
        }?;
        rustix::fs::openat2(
            dir,
            path,
            OFlags::DIRECTORY | OFlags::RDONLY | OFlags::CLOEXEC,
            Mode::empty(),
            ResolveFlags::BENEATH,
        )
    } else {
        match rustix::fs::mkdir(path, Mode::from_bits_truncate(0o744)) {
            Ok(_) => Ok(()),
            Err(e) if e == Errno::EXIST => Ok(()),
            e => e,
        }?;
        rustix::fs::open(
            path,
            OFlags::DIRECTORY | OFlags::RDONLY | OFlags::CLOEXEC,
            Mode::empty(),
        )
    }
}

fn openat_create_write(dir: &OwnedFd, key: &BlobKey) -> Result<std::fs::File, Errno> {
    let open = || {
        openat_key(
            dir,
            key,
            Mode::from_bits_truncate(0o644),
            OFlags::RDWR | OFlags::CREATE | OFlags::TRUNC | OFlags::CLOEXEC,
        )
    };
    match open() {
        Ok(f) => Ok(f),
        Err(e) if e == Errno::NOENT => {
            rustix::fs::mkdirat(dir, key.parts().0, Mode::from_bits_truncate(0o744))?;
            open()
        }
        e => e,
    }
}

fn openat_key(
    dir: &OwnedFd,
    key: &BlobKey,
    mode: Mode,
    flags: OFlags,
) -> Result<std::fs::File, Errno> {
    let fd = rustix::fs::openat2(dir, key.as_path(), flags, mode, ResolveFlags::BENEATH)?;
    Ok(fd.into())
}

// wish there was unlinkat2 with BENEATH
fn unlinkat(dir: &OwnedFd, key: &BlobKey) -> Result<(), Errno> {
    rustix::fs::unlinkat(dir, key.as_path(), AtFlags::empty())
}
