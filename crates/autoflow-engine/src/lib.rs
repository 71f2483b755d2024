//! autoflow-engine: a typed, satisfaction-driven dataflow dispatch engine.
//!
//! Filters declare the decoration types they require, optionally consume,
//! and publish. A [`factory::AutoPacketFactory`] mints [`packet::AutoPacket`]s
//! wired against the current filter set; decorating a packet runs every
//! filter whose required inputs just became fully satisfied, recursively,
//! until the packet quiesces.

pub mod container;
mod disposition;
pub mod error;
pub mod factory;
pub mod filter;
pub mod packet;
pub mod pool;
mod sat_counter;
pub mod type_key;

pub use container::{Container, StaticContainer};
pub use error::EngineError;
pub use factory::AutoPacketFactory;
pub use filter::{FilterDescriptor, FilterId, FilterInput, InputKind};
pub use packet::{AutoPacket, ImmediateBatch, PacketCheckout};
pub use pool::{ObjectPool, PooledEntity};
pub use type_key::TypeKey;
