//! # Briefsync Testkit
//!
//! Test utilities for the briefsync engine.
//!
//! This crate provides:
//! - `MemoryRepository`, an in-memory remote with failure injection
//! - `SimulatedEngine`, a native engine keeping records in a JSON file
//! - Fixtures for cache roots, managers and tracing
//! - Property-based test generators using proptest
//!
//! ## Usage
//!
//! ```rust,ignore
//! use briefsync_testkit::prelude::*;
//!
//! #[tokio::test]
//! async fn downloads_latest() {
//!     let env = TestEnv::new();
//!     let (repo, _) = env.seed_repository(3);
//!     let briefcase = env
//!         .manager
//!         .download(repo, &VersionRef::Latest, &CancellationHandle::new())
//!         .await
//!         .unwrap();
//! }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod fixtures;
pub mod generators;
pub mod native;
pub mod remote;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::fixtures::*;
    pub use crate::generators::*;
    pub use crate::native::*;
    pub use crate::remote::*;
    pub use briefsync_engine::*;
    pub use briefsync_protocol::*;
}

pub use fixtures::*;
pub use generators::*;
pub use native::*;
pub use remote::*;
