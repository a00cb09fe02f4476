//! Image distribution.
//!
//! Resolves references against a registry, applies layers into per-image
//! roots and keeps the local image index.

mod distributor;
pub mod extract;
pub mod manifest;
pub mod reference;
pub mod registry;
mod store;

#[cfg(test)]
mod testutil;

pub use distributor::ImageDistributor;
pub(crate) use distributor::dir_size;
pub use manifest::{ImageConfig, ImageManifest, Manifest, ManifestList};
pub use reference::ImageReference;
pub use registry::{RegistryAuth, RegistryClient};
pub use store::{normalize_tag, Image, ImageStore};
