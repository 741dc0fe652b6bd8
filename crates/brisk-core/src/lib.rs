//! Core types for Brisk: task entities, queued mutations, domain events and
//! the encrypted blob storage contract. Kept free of I/O so every other crate
//! can depend on it.

pub mod events;
pub mod mutation;
pub mod storage;
pub mod tasks;
