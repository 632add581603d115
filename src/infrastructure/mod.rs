#[cfg(test)]
pub(crate) mod faulty;
pub mod in_memory;
#[cfg(feature = "storage-rocksdb")]
pub mod rocksdb;
