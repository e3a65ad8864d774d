//! Slash-separated path resolution over the directory layer.
//!
//! There is no process table here, so callers supply the starting point
//! explicitly: an absolute path always starts from the root inode, and a
//! relative path starts from whatever [`InodeRef`] the caller passes as
//! `cwd`.

use fs_types::InodeNo;

use crate::{BLOCK_SIZE, Error, FileSystem, InodeRef};

/// Splits the next path element off the front of `path`, skipping both the
/// leading slashes and the run of slashes that follows the element. Returns
/// the element and what remains, or `None` once `path` is exhausted.
fn skip_elem(path: &[u8]) -> Option<(&[u8], &[u8])> {
    let mut path = path;
    while path.first() == Some(&b'/') {
        path = &path[1..];
    }
    if path.is_empty() {
        return None;
    }
    let end = path.iter().position(|&c| c == b'/').unwrap_or(path.len());
    let (elem, mut rest) = path.split_at(end);
    while rest.first() == Some(&b'/') {
        rest = &rest[1..];
    }
    Some((elem, rest))
}

impl<D> FileSystem<D>
where
    D: block_io::BlockDevice<BLOCK_SIZE, Error = std::io::Error>,
{
    /// Walks `path`, optionally stopping one element early.
    ///
    /// When `parent` is `true`, resolves every element except the last and
    /// returns the last element's raw bytes alongside the directory that
    /// should contain it; the named entry need not exist. Otherwise resolves
    /// the whole path and returns the inode it names.
    fn namex<'a>(
        &'a self,
        cwd: &InodeRef<'a, D>,
        path: &[u8],
        parent: bool,
    ) -> Result<(InodeRef<'a, D>, Option<Vec<u8>>), Error> {
        let mut ip = if path.first() == Some(&b'/') {
            self.iget(InodeNo::ROOT)
        } else {
            cwd.clone()
        };

        let mut rest = path;
        loop {
            let Some((elem, next_rest)) = skip_elem(rest) else {
                return Ok((ip, None));
            };
            rest = next_rest;

            let locked = ip.ilock()?;
            if !locked.is_dir() {
                return Err(Error::InvalidArgument);
            }

            if parent && skip_elem(rest).is_none() {
                drop(locked);
                return Ok((ip, Some(elem.to_vec())));
            }

            let mut locked = locked;
            let Some(next_ino) = locked.lookup(elem)? else {
                return Err(Error::InvalidArgument);
            };
            drop(locked);
            ip = self.iget(next_ino);
        }
    }

    /// Resolves `path` (relative to `cwd` unless absolute) to an inode.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidArgument`] if any path element does not
    /// exist, or an intermediate element is not a directory.
    pub fn namei<'a>(&'a self, cwd: &InodeRef<'a, D>, path: &[u8]) -> Result<InodeRef<'a, D>, Error> {
        let (ip, _) = self.namex(cwd, path, false)?;
        Ok(ip)
    }

    /// Resolves `path`'s parent directory and returns it alongside the
    /// final element's raw name, without requiring that name to exist.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidArgument`] if `path` is empty, an
    /// intermediate element does not exist, or is not a directory.
    pub fn nameiparent<'a>(
        &'a self,
        cwd: &InodeRef<'a, D>,
        path: &[u8],
    ) -> Result<(InodeRef<'a, D>, Vec<u8>), Error> {
        let (ip, name) = self.namex(cwd, path, true)?;
        let name = name.ok_or(Error::InvalidArgument)?;
        Ok((ip, name))
    }
}

#[cfg(test)]
mod tests {
    use fs_types::{InodeNo, T_DIR};

    use super::skip_elem;
    use crate::test_support::small_fs;

    #[test]
    fn skip_elem_splits_on_slash() {
        assert_eq!(skip_elem(b"a/bb/c"), Some((&b"a"[..], &b"bb/c"[..])));
        assert_eq!(skip_elem(b"///a//bb"), Some((&b"a"[..], &b"bb"[..])));
        assert_eq!(skip_elem(b"a"), Some((&b"a"[..], &b""[..])));
        assert_eq!(skip_elem(b""), None);
        assert_eq!(skip_elem(b"/"), None);
        assert_eq!(skip_elem(b"////"), None);
    }

    fn mkdir(fs: &crate::FileSystem<crate::device::MemBlockDevice>, parent_ino: InodeNo, name: &[u8]) -> InodeNo {
        let parent = fs.iget(parent_ino);
        let child = fs.ialloc(T_DIR).unwrap();
        {
            let mut cp = child.ilock().unwrap();
            cp.link(b".", child.inum()).unwrap();
            cp.link(b"..", parent_ino).unwrap();
            cp.set_nlink(1);
        }
        let mut pp = parent.ilock().unwrap();
        pp.link(name, child.inum()).unwrap();
        child.inum()
    }

    #[test]
    fn relative_and_absolute_paths_resolve_to_the_same_inode() {
        let fs = small_fs();
        let x = mkdir(&fs, InodeNo::ROOT, b"x");
        let y = mkdir(&fs, x, b"y");
        let z = mkdir(&fs, y, b"z");

        let cwd = fs.iget(x);
        let via_relative = fs.namei(&cwd, b"y/z").unwrap();
        let via_absolute = fs.namei(&cwd, b"/x/y/z").unwrap();
        assert_eq!(via_relative.inum(), z);
        assert_eq!(via_absolute.inum(), z);
    }

    #[test]
    fn nameiparent_splits_parent_and_final_name() {
        let fs = small_fs();
        let x = mkdir(&fs, InodeNo::ROOT, b"x");
        let y = mkdir(&fs, x, b"y");
        mkdir(&fs, y, b"z");

        let cwd = fs.iget(x);
        let (parent, name) = fs.nameiparent(&cwd, b"/x/y/z").unwrap();
        assert_eq!(parent.inum(), y);
        assert_eq!(name.as_slice(), b"z");
    }

    #[test]
    fn namei_of_missing_element_fails() {
        let fs = small_fs();
        let cwd = fs.iget(InodeNo::ROOT);
        assert!(fs.namei(&cwd, b"nope").is_err());
    }
}
