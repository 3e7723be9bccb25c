pub mod health_handlers;
pub mod media_handlers;
pub mod rewrite_handlers;
pub mod sync_handlers;
