// Asset loading - meshes (OBJ via tobj) and textures (via image)
//
// Decoding only. GPU upload happens in the renderer.

pub mod mesh;
pub mod texture;

pub use mesh::{Mesh, Vertex};
pub use texture::TextureData;
