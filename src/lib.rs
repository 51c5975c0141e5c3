//! Bluetooth LE GATT client session and attribute cache engine.
//!
//! Multiplexes registered applications over shared per-peer GATT sessions:
//! per-session ATT command serialization, attribute cache discovery and
//! persistence, notification routing, and automatic service-change
//! recovery. The engine is transport-agnostic; integrators implement
//! [`transport::Transport`] and [`store::CacheStore`] and drive everything
//! through [`client`] messages.

pub mod att;
pub mod cache;
pub mod client;
pub mod le;
pub mod store;
pub mod transport;
pub mod uuid;

mod util;

pub use crate::util::Slot;
