//! updraft-lib: the update engine behind `updraft`
//!
//! Keeps an application install directory in step with what its server publishes:
//! - `Application`: the manifest, its resources and the versioned appbase they come from
//! - `Digest`: signed path to hash listings that decide whether a file is intact
//! - `verify`: concurrent checking of resources against the digest
//! - `Updater`: the bounded loop that verifies, downloads, patches, installs and launches
//! - `ResourceCache` and `gc`: the content-addressed code cache and its collector

pub mod app;
pub mod archive;
pub mod cache;
pub mod config;
pub mod consts;
pub mod digest;
pub mod env;
pub mod gc;
pub mod lock;
pub mod net;
pub mod patch;
pub mod progress;
pub mod resource;
pub mod runtime;
pub mod signature;
pub mod status;
pub mod update;
pub mod verify;
