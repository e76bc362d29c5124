pub mod encoder;
pub mod wal2json;
