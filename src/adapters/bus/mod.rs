//! Bus adapters.

pub mod memory;

pub use memory::MemoryBus;
