//! Block-storage REST API client
//!
//! Client for the block-storage service that backs networked machine
//! volumes. Covers the operations the reconcilers need: volume CRUD,
//! node attach, snapshot creation, and backup creation/lookup.
//!
//! # Example
//!
//! ```no_run
//! use storage_client::{CreateVolumeRequest, StorageClient, StorageClientTrait};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let client = StorageClient::new(
//!     "http://longhorn-backend:9500".to_string(),
//!     String::new(),
//!     String::new(),
//!     false,
//! )?;
//!
//! if client.get_volume("vm-root").await?.is_none() {
//!     client
//!         .create_volume(CreateVolumeRequest {
//!             name: "vm-root".into(),
//!             frontend: "iscsi".into(),
//!             size: "10Gi".into(),
//!             base_image: String::new(),
//!             number_of_replicas: 3,
//!             stale_replica_timeout: 20,
//!         })
//!         .await?;
//! }
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod error;
pub mod models;
#[path = "trait.rs"]
pub mod storage_trait;
#[cfg(feature = "test-util")]
pub mod mock;

pub use client::StorageClient;
pub use error::StorageError;
pub use models::*;
pub use storage_trait::StorageClientTrait;
#[cfg(feature = "test-util")]
pub use mock::MockStorageClient;
