// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! AEGIS Bridge Core
//!
//! Relays multi-step message exchanges between two independently
//! administered domains over an authenticated, optionally encrypted link.
//!
//! # Architecture
//!
//! - **Layer:** Core System
//! - **Purpose:** Handshake, correlation and relay engine, wire protocol

pub mod domain;
pub mod application;
pub mod infrastructure;

pub use domain::*;
