// Session-scoped Persistence
// "What the page forgets on reload, the session remembers"

mod auth;
mod navigation;
mod storage;

pub use auth::{AuthTokenStore, AUTH_TOKEN_STORAGE_KEY};
pub use navigation::{
    NavigationEntry, NavigationStatePersistence, PageStateDocument, UploadProgress, UploadStatus,
    NAVIGATION_STATE_STORAGE_KEY, PAGE_STATE_STORAGE_KEY,
};
pub use storage::{FileStorage, KeyValueStorage, MemoryStorage};

#[cfg(test)]
mod tests;
