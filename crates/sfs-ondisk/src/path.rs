//! Absolute path splitting.

use sfs_error::{Result, SfsError};
use sfs_types::MAX_NAME_LEN;

/// Split an absolute path into validated components.
///
/// Empty components (`//`, trailing `/`) are skipped; `.` and `..` are
/// rejected; every name must fit an inode record.
pub fn components(path: &str) -> Result<Vec<&str>> {
    if !path.starts_with('/') {
        return Err(SfsError::InvalidPath(path.to_owned()));
    }
    path.split('/')
        .filter(|part| !part.is_empty())
        .map(|part| validate_name(path, part))
        .collect()
}

/// Split into parent components and the final name. The root has no final
/// name and is rejected with `InvalidPath`.
pub fn split_parent(path: &str) -> Result<(Vec<&str>, &str)> {
    let mut parts = components(path)?;
    let Some(name) = parts.pop() else {
        return Err(SfsError::InvalidPath(path.to_owned()));
    };
    Ok((parts, name))
}

fn validate_name<'a>(path: &str, name: &'a str) -> Result<&'a str> {
    if name == "." || name == ".." || name.contains('\0') {
        return Err(SfsError::InvalidPath(path.to_owned()));
    }
    if name.len() > MAX_NAME_LEN {
        return Err(SfsError::NameTooLong);
    }
    Ok(name)
}
