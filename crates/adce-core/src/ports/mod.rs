//! Ports - 外部システムへの抽象化レイヤー
//!
//! Each trait is a seam to something the engine does not own: time, ids,
//! inventory providers, storage, data sources.

pub mod clock;
pub mod id_generator;
pub mod inventory;
pub mod persistence;
pub mod source_adapter;

pub use self::clock::{Clock, FixedClock, SystemClock};
pub use self::id_generator::{IdGenerator, UlidGenerator};
pub use self::inventory::{ActualInventory, ExpectedInventory, InventoryItem, ReconcileWindow};
pub use self::persistence::{Persistence, TerminalRecord};
pub use self::source_adapter::{FetchOutput, SourceAdapter};
