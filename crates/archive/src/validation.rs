use std::path::{Component, Path};

use cumulus_transfer::TransferError;

/// Validates that an archive entry path cannot escape the extraction root.
///
/// Rejects:
/// - Empty paths
/// - Absolute paths
/// - Parent directory traversal (`..`)
/// - Windows prefix components (`C:`, `\\server`)
pub fn validate_entry_path(entry_path: &str) -> Result<(), TransferError> {
    if entry_path.is_empty() {
        return Err(TransferError::Validation("empty archive entry path".into()));
    }

    let path = Path::new(entry_path);

    if path.is_absolute() {
        return Err(TransferError::Validation(format!(
            "absolute archive entry path: {entry_path}"
        )));
    }

    for component in path.components() {
        match component {
            Component::ParentDir => {
                return Err(TransferError::Validation(format!(
                    "parent directory traversal in archive entry: {entry_path}"
                )));
            }
            Component::Prefix(_) => {
                return Err(TransferError::Validation(format!(
                    "path prefix in archive entry: {entry_path}"
                )));
            }
            Component::RootDir => {
                return Err(TransferError::Validation(format!(
                    "absolute archive entry path: {entry_path}"
                )));
            }
            Component::CurDir | Component::Normal(_) => {}
        }
    }

    Ok(())
}
