// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Flow tracing attributes carried alongside exchanges.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One step of a traced flow, identifying where in the flow a message was sent from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraceStep {
    pub flow_instance_id: String,
    pub flow_step_id: String,
    /// Step this one continues from, when the flow crossed a bridge.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_step_id: Option<String>,
}

impl TraceStep {
    /// Start a brand-new flow.
    pub fn new_flow() -> Self {
        Self {
            flow_instance_id: Uuid::new_v4().to_string(),
            flow_step_id: Uuid::new_v4().to_string(),
            parent_step_id: None,
        }
    }

    /// Next step within the same flow instance.
    pub fn next_step(&self) -> Self {
        Self {
            flow_instance_id: self.flow_instance_id.clone(),
            flow_step_id: Uuid::new_v4().to_string(),
            parent_step_id: Some(self.flow_step_id.clone()),
        }
    }
}

/// Trace context captured when an exchange leaves over the wire, restored
/// when the matching reply comes back.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TraceContext {
    pub step: Option<TraceStep>,
}

impl TraceContext {
    pub fn new(step: Option<TraceStep>) -> Self {
        Self { step }
    }

    /// Span used while an exchange is processed under this context.
    pub fn span(&self, exchange_id: &str) -> tracing::Span {
        match &self.step {
            Some(step) => tracing::info_span!(
                "bridge_exchange",
                exchange_id = %exchange_id,
                flow_instance_id = %step.flow_instance_id,
                flow_step_id = %step.flow_step_id,
                parent_step_id = ?step.parent_step_id,
            ),
            None => tracing::info_span!("bridge_exchange", exchange_id = %exchange_id),
        }
    }
}
