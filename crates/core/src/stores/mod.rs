pub mod local;
pub mod qdrant;

pub use local::LocalVectorIndex;
pub use qdrant::QdrantStore;
