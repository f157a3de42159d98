//! Core library for `Arcanum`.
//!
//! Contains the seal manager, the encryption barrier, the transit crypto
//! engine, the versioned KV store, the PKI certificate authority engine, the
//! path policy evaluator and the audit system. This crate depends on
//! `arcanum-storage` for the storage backend trait and knows nothing about
//! transports or identity stores.
//!
//! [`Vault`](vault::Vault) wires every component around one storage backend
//! and implements the request gate: seal status first, policy second, engine
//! last.

pub mod audit;
pub mod audit_file;
pub mod barrier;
pub mod config;
pub mod crypto;
pub mod error;
pub mod kek;
pub mod kv;
pub mod pki;
pub mod policy;
pub mod seal;
pub mod transit;
pub mod vault;
