pub mod event;
pub mod media;
pub mod sync;
