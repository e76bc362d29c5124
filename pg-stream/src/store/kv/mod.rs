mod base;
mod memory;
mod redis;

pub use base::KeyValueStore;
pub use memory::MemoryKeyValueStore;
pub use redis::RedisKeyValueStore;
