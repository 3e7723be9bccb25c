//! Shared application state handed to every handler.

use crate::{
    config::AppConfig,
    services::{
        batch_engine::{BatchEngine, ExistingFiles},
        hooks::ActivityJournal,
        ingest::IngestHandler,
        media_library::MediaLibrary,
        object_store::{ObjectStoreClient, Transport},
        offloader::MediaOffloader,
        url_resolver::UrlResolver,
    },
};
use sqlx::SqlitePool;
use std::{path::PathBuf, sync::Arc};

#[derive(Clone)]
pub struct AppState {
    pub library: MediaLibrary,
    pub offloader: MediaOffloader,
    pub engine: BatchEngine,
    pub resolver: UrlResolver,
    pub ingest: IngestHandler,
    pub journal: ActivityJournal,
    pub uploads_dir: PathBuf,
}

impl AppState {
    /// Wire every component from the configuration. The journal is the
    /// collaborator notified of uploads and deletions.
    pub fn new(cfg: &AppConfig, db: Arc<SqlitePool>, transport: Arc<dyn Transport>) -> Self {
        let library = MediaLibrary::new(db.clone());
        let journal = ActivityJournal::new(db);
        let client = ObjectStoreClient::new(cfg.credentials.clone(), &cfg.store, transport);
        let offloader = MediaOffloader::new(
            client,
            library.clone(),
            Arc::new(journal.clone()),
            cfg.policy.clone(),
        );

        Self {
            engine: BatchEngine::new(library.clone(), offloader.clone(), Arc::new(ExistingFiles)),
            resolver: UrlResolver::new(
                library.clone(),
                cfg.uploads_dir.clone(),
                &cfg.uploads_base_url,
                cfg.policy.enable_url_rewrite,
            ),
            ingest: IngestHandler::new(
                library.clone(),
                offloader.clone(),
                cfg.uploads_dir.clone(),
                cfg.policy.clone(),
            ),
            library,
            offloader,
            journal,
            uploads_dir: cfg.uploads_dir.clone(),
        }
    }
}
