//! Named volumes.
//!
//! `VolumeStore` keeps the volume records and owns each volume's data
//! directory; containers bind them by name.

mod store;

pub use store::VolumeStore;
