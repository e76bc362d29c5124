pub mod checkpoint;
pub mod kv;
