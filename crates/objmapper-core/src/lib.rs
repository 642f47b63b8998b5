//! # objmapper-core
//!
//! Core of the objmapper daemon: a local object store that hands clients
//! kernel file descriptors over a Unix-domain socket instead of streaming
//! object bytes. Objects live on tiered backends (memory, NVMe, SSD, HDD,
//! network) and migrate between tiers based on access heat and capacity.
//!
//! The crate is organized leaves-first:
//!
//! - [`fdpass`]: SCM_RIGHTS descriptor passing primitive.
//! - [`payload`]: versioned payload descriptor schema.
//! - [`index`]: lock-free URI index with refcounted entries and handles.
//! - [`backend`]: tier registry, object lifecycle, migration, promoter.
//! - [`protocol`]: V1/V2 wire codec, client and server connections.
//! - [`server`]: the per-connection daemon loop.
//!
//! No `unsafe` code is permitted at the crate level; the exceptions are the
//! index module (raw-pointer collision chains) and the fd-pass module
//! (adopting descriptors received from the kernel).

#![deny(unsafe_code)]

pub mod backend;
pub mod clock;
pub mod error;
#[allow(unsafe_code)]
pub mod fdpass;
#[allow(unsafe_code)]
pub mod index;
pub mod payload;
pub mod protocol;
pub mod server;

pub use backend::{BackendKind, BackendManager, CreateRequest};
pub use error::{MapperError, Status};
pub use index::ObjectHandle;
pub use protocol::{ClientConnection, Hello, Params, Request, Response, Version};
