//! Storage handlers.
//!
//! [`StorageHandler`] is the boundary to wherever files live. The generator
//! only talks to storages through it; [`LocalFolderHandler`] is the
//! implementation for folders on the local filesystem.

mod error;
mod handler;
mod local;

use std::sync::Arc;

pub use error::{StorageError, StorageResult};
pub use handler::{
    FileHandle, FileProperties, StorageEvent, StorageEventKind, StorageHandler, StorageObject,
    StorageOptions, file_name_of, relative_path_of,
};
pub use local::LocalFolderHandler;

use crate::config::{StorageConfig, StorageKind};
use crate::watcher::WatcherOptions;

/// Build the storage described by a configuration entry.
pub fn open_storage(config: &StorageConfig, watcher_options: WatcherOptions) -> StorageObject {
    match config.kind {
        StorageKind::LocalFolder => {
            let handler = LocalFolderHandler::new(&config.id, &config.base_path)
                .with_only_selected_files(config.only_selected_files)
                .with_watcher_options(watcher_options);
            let options = handler.options();
            StorageObject::new(&config.id, options, Arc::new(handler))
        }
    }
}
