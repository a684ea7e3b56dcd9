pub mod blob_store;
pub mod instrumentation;
pub mod integrity;
pub mod metadata_cache;
pub mod metadata_store;
pub mod read_path;
pub mod segmenter;
pub mod storage_service;
pub mod write_path;

#[cfg(test)]
pub(crate) mod test_support;
