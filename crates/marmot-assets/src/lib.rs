pub mod model;
pub mod repo;
pub mod service;

pub use model::{Asset, AssetChange, AssetChangeKind, AssetInput, AssetSignature, OwnerRef};
pub use repo::{AssetRepo, InMemoryAssetRepo, SqlAssetRepo};
pub use service::{AssetChangeObserver, AssetService};
