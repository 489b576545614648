//! Docker access for regnet.
//!
//! Only the image catalog lives here: which node images are present locally
//! and pulling the ones a network still needs.

mod images;

pub use images::{ImageCatalog, canonical_image_id, qualified_image};
