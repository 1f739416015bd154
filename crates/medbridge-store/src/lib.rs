//! # MedBridge Store
//!
//! 规范化存储层: 仓库接口、内存实现、PostgreSQL实现与进程内锁表。

pub mod locks;
pub mod memory;
pub mod postgres;
pub mod repository;

pub use locks::{KeyedLocks, VenueLocks};
pub use memory::MemoryStore;
pub use postgres::PgStore;
pub use repository::Store;
