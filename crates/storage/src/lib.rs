pub mod area;
pub mod file;
pub mod memory;

pub use area::{AreaName, StorageArea, StorageAreas, StorageChange};
pub use file::FileArea;
pub use memory::MemoryArea;
