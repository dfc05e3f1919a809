//! Built-in transfer modules
//!
//! Each module exposes a `spec()` constructor returning its
//! [`TransferSpec`](crate::transfer::TransferSpec) and is registered by name
//! in [`ModuleRegistry::builtin`](crate::registry::ModuleRegistry::builtin).

pub mod customers;
pub mod orders;
