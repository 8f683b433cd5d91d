// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Domain
//!
//! Value types, invariants and collaborator traits of the bridge.
//!
//! # Architecture
//!
//! - **Layer:** Domain Layer
//! - **Purpose:** Service keys, exchanges, envelopes, correlation state,
//!   handshake policy and configuration

pub mod service_key;
pub mod trace;
pub mod exchange;
pub mod envelope;
pub mod correlation;
pub mod handshake;
pub mod router;
pub mod channel;
pub mod events;
pub mod error;
pub mod bridge_config;
