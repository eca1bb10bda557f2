pub mod qdrant;
pub mod visual;

pub use qdrant::QdrantTextIndex;
pub use visual::{HttpVisualIndex, StubVisualIndex};
