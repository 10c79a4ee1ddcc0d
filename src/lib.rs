// Copyright 2026 Percolator Contributors
// SPDX-License-Identifier: Apache-2.0

//! Percolator keeps a proxy subscription freshly brewed.
//!
//! The pipeline: a real Chrome session logs into the provider portal and
//! extracts the subscription URL, the payload is fetched and normalized into
//! a canonical Clash document, and the result is persisted as a three-file
//! snapshot served over HTTP to Clash and Shadowrocket clients.

#![allow(dead_code, unused_imports, clippy::new_without_default)]

pub mod cli;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod fetch;
pub mod model;
pub mod normalize;
pub mod notify;
pub mod portal;
pub mod scheduler;
pub mod server;
pub mod store;
pub mod usage;
