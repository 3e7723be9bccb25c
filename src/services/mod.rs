pub mod batch_engine;
pub mod hooks;
pub mod ingest;
pub mod keys;
pub mod media_library;
pub mod object_store;
pub mod offloader;
pub mod progress;
pub mod signer;
pub mod sync_selector;
pub mod url_resolver;
