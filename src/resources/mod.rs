//! Resource management
//!
//! Meshes, textures and materials shared between render data.

mod material;
mod mesh;
mod texture;

pub use material::*;
pub use mesh::*;
pub use texture::*;
