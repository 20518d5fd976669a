//! Self-contained VM executables.
//!
//! A cast artifact is a small runtime executable with a Linux kernel, an
//! init filesystem, a workload filesystem and some workload metadata
//! appended to it. Running the artifact finds that payload inside itself,
//! extracts it once into a per-user cache and boots a VM from it.
//!
//! - **Payload formats** - trailer, sparse region encoding, metadata
//! - **Assembly** - building an artifact from its parts
//! - **Mach-O patching** - making the appended payload signable
//! - **Location and extraction** - finding and caching the payload at run time
//! - **Runtime** - booting the extracted payload
//!
//! # Architecture
//!
//! ```text
//! build time                          run time
//!
//! container-cast cast                 cast-runner (the artifact itself)
//!     │                                   │
//!     ├── assemble()                      ├── ExecutableLocator
//!     │     ├── sparse::compact           ├── ExtractionCache::obtain
//!     │     └── Trailer::encode           │     ├── locate()
//!     ├── macho::prepare_for_signing      │     └── sparse::reconstruct
//!     └── sign::sign_adhoc                └── VmRuntime::boot
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use container_cast::cache::ExtractionCache;
//!
//! let cache = ExtractionCache::new(ExtractionCache::default_root());
//! let payload = cache.obtain(std::path::Path::new("./my-app"))?;
//! println!("kernel at {}", payload.kernel.display());
//! ```

pub mod assemble;
pub mod cache;
pub mod config;
pub mod error;
pub mod format;
pub mod locate;
pub mod macho;
pub mod payload;
pub mod platform;
pub mod preflight;
pub mod runtime;
pub mod sign;

pub use cache::{ExtractedPayload, ExtractionCache};
pub use error::PayloadError;
pub use locate::{locate, LocatedTrailer};
pub use payload::{Metadata, Trailer};
