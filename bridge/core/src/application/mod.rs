// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

pub mod reconstruction;
pub mod write_supervisor;
pub mod bridge_domain;
pub mod bridge_runtime;

pub use bridge_domain::{BridgeDomain, DomainSide, InboundQueue};
pub use bridge_runtime::BridgeRuntime;
