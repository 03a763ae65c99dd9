// src/lib.rs

//! depstage: hermetic dependency staging
//!
//! Takes a repository at a commit, resolves the dependencies its lockfiles
//! pin, mirrors every artifact that does not come from a public registry into
//! an artifact store, and produces a bundle: the source, the mirrored
//! dependencies, a bill of materials and the configuration a build needs to
//! run against the store instead of the internet.
//!
//! # Architecture
//!
//! - Database-first: requests, their state history and the step queue live in SQLite
//! - Drivers: one [`drivers::LockfileDriver`] per package manager
//! - Content-addressed mirror: an artifact is fetched from its origin at most once
//! - Per-request staging repositories, torn down on failure or expiry

pub mod archive;
pub mod bom;
pub mod classify;
pub mod config;
pub mod db;
pub mod drivers;
pub mod emit;
mod error;
pub mod hash;
pub mod lifecycle;
pub mod mirror;
pub mod model;
pub mod paths;
pub mod pipeline;
pub mod process;
pub mod request;
pub mod retry;
pub mod scm;
pub mod store;
pub mod sweep;

pub use bom::BillOfMaterials;
pub use config::EngineConfig;
pub use emit::RuntimeConfig;
pub use error::{Error, ErrorKind, Result, UNKNOWN_ERROR_MESSAGE};
pub use hash::{Hash, HashAlgorithm};
pub use model::{DependencyRecord, Origin, PackageManager, PackageRecord, PackageType};
pub use pipeline::{Dispatcher, Engine, Step, Worker, WorkerPool};
pub use request::{NewRequest, Request, RequestState};
pub use store::{ArtifactStore, HttpStore, MemoryStore};
pub use sweep::StaleSweeper;
