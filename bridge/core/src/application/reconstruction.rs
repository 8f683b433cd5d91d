// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Exchange Reconstruction Protocol
//!
//! Turns a sequence of envelopes into a locally valid exchange. Used the same
//! way by consumer-side and provider-side domains.
//!
//! | step | stored exchange | effect |
//! |------|-----------------|--------|
//! | 1 | must be absent | new exchange: operation, in message, properties |
//! | > 1, not terminal | required | replace properties, attach out or fault |
//! | > 1, terminal | required | replace properties, map `DONE` / `ERROR` |
//!
//! Property replacement is a full replace of every non-protected property, so
//! a property removed by the sender disappears here too. Protected properties
//! never cross the wire and are never overwritten from it. The flow tracing
//! activation flag is written by the caller, independently of the payload.

use crate::domain::envelope::TransportedMessage;
use crate::domain::error::ReconstructionError;
use crate::domain::exchange::{properties, ExchangeFailure, ExchangeId, ExchangeStatus, FailureKind, MessageExchange, Properties};
use crate::domain::trace::TraceStep;

/// Dispatch on the envelope's step.
///
/// `fresh` is the router-created exchange used for step 1 and ignored otherwise.
pub fn reconstruct(
    stored: Option<MessageExchange>,
    message: &TransportedMessage,
    fresh: Option<MessageExchange>,
) -> Result<MessageExchange, ReconstructionError> {
    match (message.step, stored) {
        (0, _) => Err(ReconstructionError::UnexpectedStep {
            exchange_id: message.exchange_id.clone(),
            expected: 1,
            received: 0,
        }),
        (1, Some(_)) => Err(ReconstructionError::DuplicateEntry(message.exchange_id.clone())),
        (1, None) => {
            let fresh = fresh.ok_or_else(|| ReconstructionError::MissingFreshExchange(message.exchange_id.clone()))?;
            build_initial(fresh, message)
        }
        (_, None) => Err(ReconstructionError::MissingEntry(message.exchange_id.clone())),
        (_, Some(stored)) => apply_update(stored, message),
    }
}

/// Populate a router-created exchange from a step-1 envelope.
pub fn build_initial(
    mut fresh: MessageExchange,
    message: &TransportedMessage,
) -> Result<MessageExchange, ReconstructionError> {
    if message.step != 1 {
        return Err(ReconstructionError::UnexpectedStep {
            exchange_id: message.exchange_id.clone(),
            expected: 1,
            received: message.step,
        });
    }

    let snapshot = &message.snapshot;
    fresh.operation = snapshot.operation.clone();
    fresh.in_message = snapshot.in_message.clone();
    replace_properties(&mut fresh.properties, &snapshot.properties);
    fresh.trace = message.sender_trace_step.as_ref().map(TraceStep::next_step);
    Ok(fresh)
}

/// Apply a continuation envelope (step > 1) onto the stored exchange.
pub fn apply_update(
    mut stored: MessageExchange,
    message: &TransportedMessage,
) -> Result<MessageExchange, ReconstructionError> {
    if message.step < 2 {
        return Err(ReconstructionError::UnexpectedStep {
            exchange_id: message.exchange_id.clone(),
            expected: 2,
            received: message.step,
        });
    }

    let snapshot = &message.snapshot;
    replace_properties(&mut stored.properties, &snapshot.properties);

    if message.terminal {
        match snapshot.status {
            ExchangeStatus::Done => stored.complete(),
            ExchangeStatus::Error => stored.fail(
                snapshot
                    .failure
                    .clone()
                    .unwrap_or_else(|| ExchangeFailure::new(FailureKind::Remote, "remote side reported an error")),
            ),
            ExchangeStatus::Active => stored.fail(ExchangeFailure::new(
                FailureKind::Protocol,
                "terminal envelope carried an ACTIVE exchange",
            )),
        }
    } else if snapshot.out_message.is_some() && stored.out_message.is_none() {
        stored.out_message = snapshot.out_message.clone();
    } else if snapshot.fault.is_some() && stored.fault.is_none() {
        stored.fault = snapshot.fault.clone();
    }

    Ok(stored)
}

/// A reply must carry exactly the step after the one we sent.
pub fn expect_next_step(exchange_id: &ExchangeId, sent_step: u32, received: u32) -> Result<(), ReconstructionError> {
    let expected = sent_step + 1;
    if received == expected {
        Ok(())
    } else {
        Err(ReconstructionError::UnexpectedStep {
            exchange_id: exchange_id.clone(),
            expected,
            received,
        })
    }
}

fn replace_properties(target: &mut Properties, incoming: &Properties) {
    target.retain(|name, _| properties::is_protected(name));
    target.extend(
        incoming
            .iter()
            .filter(|(name, _)| !properties::is_protected(name))
            .map(|(name, value)| (name.clone(), value.clone())),
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::exchange::{ExchangePattern, ExchangeRole, NormalizedMessage};
    use crate::domain::service_key::ServiceKey;
    use serde_json::json;

    fn hello_greet() -> ServiceKey {
        ServiceKey::new("Hello", "Greet")
    }

    fn sender_exchange() -> MessageExchange {
        let mut exchange = MessageExchange::new(hello_greet(), ExchangePattern::InOut, ExchangeRole::Consumer);
        exchange.operation = "sayHello".into();
        exchange.in_message = Some(NormalizedMessage::new(json!({"name": "world"})));
        exchange
    }

    fn fresh() -> MessageExchange {
        MessageExchange::new(hello_greet(), ExchangePattern::InOut, ExchangeRole::Provider)
    }

    #[test]
    fn test_step_one_then_terminal_error_removes_property() {
        let mut sender = sender_exchange();
        sender.properties.insert("trace".into(), json!("t1"));
        let first = TransportedMessage::initial(&sender);

        let local = reconstruct(None, &first, Some(fresh())).unwrap();
        assert_eq!(local.operation, "sayHello");
        assert_eq!(local.in_message, sender.in_message);
        assert_eq!(local.properties.get("trace"), Some(&json!("t1")));

        let mut errored = sender.clone();
        errored.properties.clear();
        errored.fail(ExchangeFailure::new(FailureKind::Remote, "rejected"));
        let terminal = TransportedMessage::following(&first, &errored);

        let local = reconstruct(Some(local), &terminal, None).unwrap();
        assert_eq!(local.status, ExchangeStatus::Error);
        assert!(!local.properties.contains_key("trace"));
        assert_eq!(local.failure.map(|f| f.message), Some("rejected".to_string()));
    }

    #[test]
    fn test_property_round_trip_excludes_only_deny_list() {
        let mut sender = sender_exchange();
        sender.properties.insert("a".into(), json!(1));
        sender.properties.insert("b".into(), json!(2));
        sender.properties.insert(properties::SEND_SYNC.into(), json!(true));
        sender.properties.insert(properties::CONSUMER_ENDPOINT.into(), json!("client-ep"));

        let local = reconstruct(None, &TransportedMessage::initial(&sender), Some(fresh())).unwrap();

        let expected: Properties = [("a".to_string(), json!(1)), ("b".to_string(), json!(2))]
            .into_iter()
            .collect();
        assert_eq!(local.properties, expected);
    }

    #[test]
    fn test_protected_properties_survive_replacement() {
        let mut stored = fresh();
        stored.properties.insert(properties::SEND_SYNC.into(), json!(true));
        stored.properties.insert("stale".into(), json!("x"));
        stored.set_flow_tracing_activation(Some(false));

        let first = TransportedMessage::initial(&sender_exchange());
        let mut reply = sender_exchange();
        reply.properties.insert("fresh".into(), json!(1));
        reply.out_message = Some(NormalizedMessage::new(json!("hello")));
        let second = TransportedMessage::following(&first, &reply);

        let updated = apply_update(stored, &second).unwrap();
        assert!(updated.properties.contains_key(properties::SEND_SYNC));
        assert_eq!(updated.flow_tracing_activation(), Some(false));
        assert!(!updated.properties.contains_key("stale"));
        assert_eq!(updated.properties.get("fresh"), Some(&json!(1)));
        assert_eq!(updated.out_message, reply.out_message);
        assert_eq!(updated.status, ExchangeStatus::Active);
    }

    #[test]
    fn test_intermediate_attaches_fault_only_without_existing_content() {
        let first = TransportedMessage::initial(&sender_exchange());
        let mut faulted = sender_exchange();
        faulted.fault = Some(NormalizedMessage::new(json!({"code": 42})));
        let second = TransportedMessage::following(&first, &faulted);

        let updated = apply_update(sender_exchange(), &second).unwrap();
        assert_eq!(updated.fault, faulted.fault);

        let mut already = sender_exchange();
        already.fault = Some(NormalizedMessage::new(json!({"code": 1})));
        let untouched = apply_update(already.clone(), &second).unwrap();
        assert_eq!(untouched.fault, already.fault);
    }

    #[test]
    fn test_terminal_done_completes_stored_exchange() {
        let first = TransportedMessage::initial(&sender_exchange());
        let mut done = sender_exchange();
        done.complete();
        let terminal = TransportedMessage::following(&first, &done);

        let updated = reconstruct(Some(sender_exchange()), &terminal, None).unwrap();
        assert_eq!(updated.status, ExchangeStatus::Done);
        assert!(updated.failure.is_none());
    }

    #[test]
    fn test_step_one_with_stored_exchange_is_duplicate() {
        let first = TransportedMessage::initial(&sender_exchange());
        let err = reconstruct(Some(fresh()), &first, Some(fresh())).unwrap_err();
        assert_eq!(err, ReconstructionError::DuplicateEntry(first.exchange_id.clone()));
    }

    #[test]
    fn test_continuation_without_stored_exchange_is_missing_entry() {
        let first = TransportedMessage::initial(&sender_exchange());
        let second = TransportedMessage::following(&first, &sender_exchange());
        let err = reconstruct(None, &second, Some(fresh())).unwrap_err();
        assert!(matches!(err, ReconstructionError::MissingEntry(_)));
    }

    #[test]
    fn test_step_zero_is_rejected() {
        let mut first = TransportedMessage::initial(&sender_exchange());
        first.step = 0;
        assert!(matches!(
            reconstruct(None, &first, Some(fresh())),
            Err(ReconstructionError::UnexpectedStep { received: 0, .. })
        ));
    }

    #[test]
    fn test_initial_continues_sender_flow_with_new_step() {
        let mut sender = sender_exchange();
        let step = TraceStep::new_flow();
        sender.trace = Some(step.clone());

        let local = build_initial(fresh(), &TransportedMessage::initial(&sender)).unwrap();
        let trace = local.trace.expect("trace step");
        assert_eq!(trace.flow_instance_id, step.flow_instance_id);
        assert_ne!(trace.flow_step_id, step.flow_step_id);
        assert_eq!(trace.parent_step_id, Some(step.flow_step_id));
        assert_eq!(local.role, ExchangeRole::Provider);
    }

    #[test]
    fn test_initial_without_sender_trace_has_no_step() {
        let local = build_initial(fresh(), &TransportedMessage::initial(&sender_exchange())).unwrap();
        assert!(local.trace.is_none());
    }

    #[test]
    fn test_expect_next_step() {
        let id = ExchangeId::from("x");
        assert!(expect_next_step(&id, 1, 2).is_ok());
        assert_eq!(
            expect_next_step(&id, 2, 5),
            Err(ReconstructionError::UnexpectedStep {
                exchange_id: id.clone(),
                expected: 3,
                received: 5
            })
        );
    }
}
