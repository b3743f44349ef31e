pub mod engine;
pub mod memory;
pub mod pattern;

pub use engine::KvBackend;
pub use memory::InMemoryKv;
pub use pattern::glob_matches;
