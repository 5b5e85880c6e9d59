//! Path handling: tokenization, name validation, and resolution on a mounted volume.
//!
//! Paths are `/`-separated; a leading slash resets resolution to the root directory, anything
//! else starts from the current working directory. `"."` stays in place and `".."` follows the
//! second entry of the current directory's data.

use crate::drivers::generics::dev_disk::DiskDevice;
use crate::errors::FsError;
use crate::fs::ofs::dir::DIR_NAME_LEN;
use crate::fs::ofs::inode::{Inode, InodeNumber};
use crate::fs::ofs::OpalFs;
use crate::fs::FsResult;

/// Final component of a path: everything after the last `/`, or the path itself.
pub fn last_name(path: &str) -> &str {
    match path.rfind('/') {
        None => path,
        Some(idx) => &path[idx + 1..],
    }
}

/// Checks that `name` can be stored in a directory entry.
pub fn validate_name(name: &str) -> FsResult<&str> {
    if name.is_empty()
        || name == "."
        || name == ".."
        || name.contains('/')
        || name.len() >= DIR_NAME_LEN
    {
        return Err(FsError::Invalid);
    }

    Ok(name)
}

impl<D: DiskDevice> OpalFs<D> {
    /// Resolves `path` to its inode, starting from the root for absolute paths and from the
    /// current working directory otherwise.
    ///
    /// # Errors
    ///
    /// [`FsError::NotFound`] when any component does not exist.
    pub fn resolve(&mut self, path: &str) -> FsResult<Inode> {
        let mut current = if path.starts_with('/') {
            self.read_inode(InodeNumber::ROOT)?
        } else {
            *self.cwd()
        };

        for token in path.split('/').filter(|token| !token.is_empty()) {
            match token {
                "." => {}
                ".." => {
                    if !current.is_dir() {
                        return Err(FsError::NotFound);
                    }
                    // ".." is always the second entry of a directory's data.
                    let entry = self.read_dir_slot(&current, 1)?;
                    current = self.read_inode(entry.id)?;
                }
                name => {
                    if !current.is_dir() {
                        return Err(FsError::NotFound);
                    }
                    let entry = self
                        .lookup_in_dir(&current, name)?
                        .ok_or(FsError::NotFound)?;
                    current = self.read_inode(entry.id)?;
                }
            }
        }

        Ok(current)
    }

    /// Resolves the directory that contains the final component of `path`.
    ///
    /// The root is its own parent; a slash-free path resolves to the current working
    /// directory.
    pub fn resolve_parent(&mut self, path: &str) -> FsResult<Inode> {
        match path.rfind('/') {
            None => Ok(*self.cwd()),
            Some(0) => self.read_inode(InodeNumber::ROOT),
            Some(idx) => {
                let parent = self.resolve(&path[..idx])?;
                if !parent.is_dir() {
                    return Err(FsError::NotFound);
                }
                Ok(parent)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn last_component() {
        assert_eq!(last_name("/sub/x.txt"), "x.txt");
        assert_eq!(last_name("x.txt"), "x.txt");
        assert_eq!(last_name("/top"), "top");
        assert_eq!(last_name("a/b/c"), "c");
    }

    #[test]
    fn name_validation() {
        assert!(validate_name("notes.txt").is_ok());
        assert_eq!(validate_name(""), Err(FsError::Invalid));
        assert_eq!(validate_name("."), Err(FsError::Invalid));
        assert_eq!(validate_name(".."), Err(FsError::Invalid));
        assert_eq!(validate_name("a/b"), Err(FsError::Invalid));
        assert!(validate_name(&"n".repeat(DIR_NAME_LEN)).is_err());
        assert!(validate_name(&"n".repeat(DIR_NAME_LEN - 1)).is_ok());
    }
}
