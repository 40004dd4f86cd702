//! Image browser core: an asynchronous, cancellable, progressively refining
//! decode pipeline paired with a sectioned, sorted directory model.
//!
//! The crate has no UI of its own. An embedding application subscribes to the
//! per-image and per-model event buses, feeds configuration through
//! [`settings::Settings`] and drives the pipeline via [`model::ImageModel`]
//! and [`dirworker::DirectoryWorker`].

pub mod decoders;
pub mod dirworker;
pub mod errors;
pub mod events;
pub mod exif;
pub mod geometry;
pub mod image;
pub mod logging;
pub mod model;
pub mod pool;
pub mod settings;
pub mod sorting;

#[cfg(test)]
mod tests;

pub use crate::decoders::{Decoder, DecodingState};
pub use crate::dirworker::DirectoryWorker;
pub use crate::events::{ImageEvent, ModelEvent};
pub use crate::image::{CheckState, Image, ImageId, ViewFlags};
pub use crate::model::ImageModel;
pub use crate::pool::{DecodePool, Priority, StateFuture};
pub use crate::sorting::{SortField, SortOrder};
