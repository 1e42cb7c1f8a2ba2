mod artifacts;

pub use artifacts::{fetch_artifact, store_artifact, StoreArtifactResponse};
