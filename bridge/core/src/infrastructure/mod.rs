// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Infrastructure
//!
//! # Architecture
//!
//! - **Layer:** Infrastructure Layer
//! - **Purpose:** Wire codec, handshake driver, TLS, sockets, event bus and
//!   the in-memory local router

pub mod event_bus;
pub mod wire;
pub mod tls;
pub mod handshake;
pub mod connection;
pub mod listener;
pub mod connector;
pub mod router;
