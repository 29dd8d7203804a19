//! # host1x-core
//!
//! Userspace-facing core of a simulated Tegra host1x command-stream
//! processor: buffer-object residency in a bounded GART aperture,
//! sync-point counters and fences, a firewall-validating command-stream
//! assembler, a per-context channel scheduler, and hang recovery.
//!
//! ## Quick start
//!
//! ```no_run
//! use std::sync::Arc;
//! use host1x_core::backend::SimChannelBackend;
//! use host1x_core::config::Host1xConfig;
//! use host1x_core::device::{ChannelSpec, Device};
//! use host1x_core::submit::Pipe;
//!
//! let backend: Arc<dyn host1x_core::backend::ChannelBackend> = Arc::new(SimChannelBackend::new(1));
//! let device = Device::new(
//!     Host1xConfig::default(),
//!     "host1x",
//!     backend,
//!     &[ChannelSpec { accepted_pipes: Pipe::GR3D, ring_capacity_words: 4096 }],
//! )
//! .unwrap();
//!
//! let ctx = device.open_context();
//! let syncpt = device.reserve_syncpt().unwrap();
//! // ... assemble a command buffer referencing `syncpt`'s trailing increment,
//! // build a SubmitDescriptor, then call device.submit(&ctx, descriptor).
//! ```
//!
//! ## Architecture
//!
//! Userspace → [`submit::SubmitDescriptor`] → [`device::Device::submit`]:
//! GART residency ([`gart`]) → command-stream assembly and firewall
//! validation ([`assembler`]) → job object ([`job`]) → channel selection
//! and the push sequence ([`scheduler`]) → hardware adapter ([`backend`]).
//! [`syncpoint`] and [`mlock`] are shared collaborators every stage above
//! touches; [`recovery`] runs when a channel stops responding;
//! [`dumper`] renders a point-in-time snapshot of it all.

pub mod assembler;
pub mod backend;
pub mod bo;
pub mod client;
pub mod config;
pub mod context;
pub mod device;
pub mod dumper;
pub mod error;
pub mod firewall;
pub mod gart;
pub mod job;
pub mod mlock;
pub mod opcode;
pub mod pushbuffer;
pub mod recovery;
pub mod scheduler;
pub mod submit;
pub mod syncpoint;

pub use bo::{BackingKind, Bo, BoFlags, GartState};
pub use client::{Client, FnClient};
pub use config::{Host1xConfig, SecurityLevel};
pub use context::Context;
pub use device::{ChannelSpec, Device};
pub use dumper::DumpSnapshot;
pub use error::{Host1xError, Result};
pub use job::Job;
pub use submit::{BoTableEntry, Pipe, SubmitDescriptor, SubmitResult};
pub use syncpoint::{Fence, SyncptId};

/// Library version (from Cargo.toml).
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
