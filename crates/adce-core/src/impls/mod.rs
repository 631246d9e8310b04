//! Impls - ports の実装
//!
//! - **InMemoryPersistence / StaticInventory**: テスト・組み込み用
//! - **FsStore**: ファイルベースの Persistence + ActualInventory
//! - **ScheduleFile**: JSON ファイルから ExpectedInventory
//! - **HttpJsonAdapter**: URL テンプレートで動く汎用 SourceAdapter

pub mod fs_store;
pub mod http_adapter;
pub mod memory;
pub mod schedule_file;

pub use self::fs_store::{FsStore, StoredEntity};
pub use self::http_adapter::HttpJsonAdapter;
pub use self::memory::{InMemoryPersistence, SavedResult, StaticInventory};
pub use self::schedule_file::ScheduleFile;
