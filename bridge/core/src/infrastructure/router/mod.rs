// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

pub mod in_memory;

pub use in_memory::{EchoEndpoint, InMemoryRouter, LocalEndpoint};
