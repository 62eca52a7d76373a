//! `sh2-drc` is a dynamic recompiler for SH-2 style guest code.
//!
//! Guest code is scanned into basic blocks, translated into a compact portable host ISA and cached
//! per code region. Translated blocks branch to each other directly once both exist; stores into
//! guest memory that hold translated code invalidate the affected blocks.
//!
//! - [`scan`]: decoder and block scanner (literal pools, T propagation, in-block targets).
//! - [`translate`]: block translator on top of the [`regcache`] register cache.
//! - [`tcache`]: code arena, block descriptors, PC hash and block links.
//! - [`smc`]: self-modifying code tracking.
//! - [`runtime`]: the [`Jit`] context driving all of the above.
//!
//! The embedder provides guest memory and exception delivery through [`GuestBus`].

pub mod bus;
pub mod config;
pub mod decode;
pub mod emit;
pub mod error;
pub mod guest;
pub mod host;
pub mod regcache;
pub mod runtime;
pub mod scan;
pub mod smc;
pub mod tcache;
pub mod translate;

pub use bus::{EventOutcome, GuestBus, GuestEvent};
pub use config::{CodeRegion, JitConfig, TcacheConfig};
pub use error::{ConfigError, HostDecodeError, JitError, TranslateError};
pub use guest::{CpuState, GuestReg, RegMask, Sr};
pub use runtime::{Jit, JitStats};
pub use tcache::{BufferState, CodeAddr};
