//! Default collaborator implementations backed by the `image` crate.

mod image_codec;

pub use image_codec::{ImageCrateDecoder, PngEncoder};
