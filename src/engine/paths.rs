// kmem: Filesystem locations
//
// Resolves the engine's data directory and database path. Config overrides win;
// otherwise the platform data dir (`~/.local/share/kmem` on Linux) is used.

use std::path::PathBuf;

use crate::atoms::constants::DATA_DIR_NAME;
use crate::atoms::error::{EngineError, EngineResult};
use crate::engine::config::StorageConfig;

/// Root data directory for the engine. Created on demand.
pub fn data_dir(storage: &StorageConfig) -> EngineResult<PathBuf> {
    let dir = match &storage.data_dir {
        Some(dir) => dir.clone(),
        None => dirs::data_local_dir()
            .or_else(dirs::home_dir)
            .map(|base| base.join(DATA_DIR_NAME))
            .ok_or_else(|| EngineError::Config("cannot resolve a data directory".into()))?,
    };
    std::fs::create_dir_all(&dir)?;
    Ok(dir)
}

/// Full path of the SQLite database file.
pub fn db_path(storage: &StorageConfig) -> EngineResult<PathBuf> {
    Ok(data_dir(storage)?.join(&storage.db_file))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn explicit_data_dir_is_created() {
        let tmp = tempfile::tempdir().unwrap();
        let storage = StorageConfig {
            data_dir: Some(tmp.path().join("nested").join("kmem")),
            ..Default::default()
        };
        let path = db_path(&storage).unwrap();
        assert!(path.parent().unwrap().is_dir());
        assert!(path.ends_with("memories.db"));
    }
}
