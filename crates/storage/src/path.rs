//! Path validation and on-disk layout helpers.
//!
//! Blob names are used verbatim as relative paths under a store root, so
//! every path is validated before it touches the filesystem.

use std::path::{Component, Path, PathBuf};

use crate::error::{ErrorKind, Result};

/// Names shorter than this are stored flat instead of being sharded.
const RADIX_MIN_LEN: usize = 5;

/// Validates a storage path for security and correctness.
/// Ensures that paths don't escape the storage root (no `..` traversal).
///
/// > **Note:** This does **not** normalize backslashes, non-UTF8 bytes, or
/// >           platform-specific weirdness. Null bytes are explicitly rejected.
///
/// # Returns
/// Returns the normalized path if valid, or [`InvalidPath`](crate::error::ErrorKind::InvalidPath)
/// if invalid.
///
/// # Examples
///
/// ```
/// use std::path::Path;
/// use diffcache_storage::validate_path;
/// assert!(validate_path("dm-images-v1/abcdef.png").is_ok());
/// assert!(validate_path("ab/cd/abcdef.png").is_ok());
/// assert!(validate_path("../etc/passwd").is_err());
/// assert!(validate_path("a\0b").is_err());
/// assert_eq!(validate_path("ab/./cd//abcdef.png/").unwrap(), Path::new("ab/cd/abcdef.png"));
/// ```
pub fn validate(path: impl AsRef<Path>) -> Result<PathBuf> {
    let mut components = Vec::new();
    for component in path.as_ref().components() {
        match component {
            Component::Normal(s) => {
                // Null bytes pass through Path::components() on Unix but cause
                // truncation in C-based syscalls.
                if s.as_encoded_bytes().contains(&0) {
                    exn::bail!(ErrorKind::InvalidPath(path.as_ref().to_path_buf()));
                }
                components.push(s)
            },
            Component::CurDir | Component::RootDir => {},
            Component::Prefix(_) => exn::bail!(ErrorKind::InvalidPath(path.as_ref().to_path_buf())),
            Component::ParentDir => {
                if components.pop().is_none() {
                    exn::bail!(ErrorKind::InvalidPath(path.as_ref().to_path_buf()));
                }
            },
        }
    }
    match components.is_empty() {
        true => exn::bail!(ErrorKind::InvalidPath(path.as_ref().to_path_buf())),
        false => Ok(components.into_iter().collect()),
    }
}

/// Two-level radix path for a file name: `abcdef.png` becomes
/// `ab/cd/abcdef.png`.
///
/// Keeps the number of entries per directory bounded when millions of
/// content-addressed files share one root. Names shorter than five
/// characters (or not splittable on a character boundary) are left flat.
///
/// ```
/// use std::path::Path;
/// use diffcache_storage::radix_path;
/// assert_eq!(radix_path("abcdef.png"), Path::new("ab/cd/abcdef.png"));
/// assert_eq!(radix_path("a.png"), Path::new("a.png"));
/// ```
pub fn radix(file_name: &str) -> PathBuf {
    if file_name.len() < RADIX_MIN_LEN {
        return PathBuf::from(file_name);
    }
    match (file_name.get(0..2), file_name.get(2..4)) {
        (Some(first), Some(second)) => [first, second, file_name].iter().collect(),
        _ => PathBuf::from(file_name),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("dm-images-v1/abc.png", "dm-images-v1/abc.png")]
    #[case("ab/cd/abcdef.png", "ab/cd/abcdef.png")]
    #[case("a//b//c.png", "a/b/c.png")]
    #[case("a/./b/./c.png", "a/b/c.png")]
    #[case("ab/cd/..", "ab")]
    #[case("images///", "images")]
    fn test_valid_paths(#[case] input: &str, #[case] expected: &str) {
        assert_eq!(validate(Path::new(input)).unwrap(), Path::new(expected));
    }

    #[rstest]
    #[case("../etc/passwd")]
    #[case("a/../../b")]
    #[case("..")]
    #[case("a\0b")]
    #[case("")]
    #[case("./.")]
    #[case("//")]
    fn test_invalid_paths(#[case] input: &str) {
        let err = validate(Path::new(input)).unwrap_err();
        assert!(matches!(&*err, ErrorKind::InvalidPath(_)));
    }

    #[rstest]
    #[case("abcdef0123.png", "ab/cd/abcdef0123.png")]
    #[case("abcd-ef01.png", "ab/cd/abcd-ef01.png")]
    #[case("abcde", "ab/cd/abcde")]
    #[case("abcd", "abcd")]
    #[case("", "")]
    fn test_radix(#[case] input: &str, #[case] expected: &str) {
        assert_eq!(radix(input), Path::new(expected));
    }

    #[test]
    fn test_radix_multibyte_boundary() {
        // "é" spans bytes 1..3, so the first shard can't be cut at byte 2.
        assert_eq!(radix("aébcdef"), Path::new("aébcdef"));
    }
}
