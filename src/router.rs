//! Correlation routing: external events to instance backlogs.
//!
//! The router is the subscription surface of a process-manager runtime. It
//! holds one rule per external event type; a rule computes the correlation
//! id and the internal event the external one maps to. External event types
//! with no rule are simply not subscribed to, and a rule may return `None`
//! to filter out individual events it does not care about.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::event::EventDraft;

/// An event arriving from outside the process manager, before routing.
///
/// Typically a domain event published by some aggregate. Only the id is
/// interpreted by this crate (for deterministic internal id derivation);
/// type and payload are passed through to the routing rule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExternalEvent {
    /// Globally unique id of the external event.
    pub id: Uuid,
    /// External event type name (e.g. `"ParkingSessionStarted"`).
    pub event_type: String,
    /// JSON payload as published by the source.
    pub payload: Value,
}

/// Delivery context accompanying an external event: where it came from in
/// its source stream. Routing rules may fold this into the correlation id.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeliveryMetadata {
    /// Correlation id of the source stream the event was delivered from.
    pub source_correlation_id: Option<String>,
    /// The event's sequence number within its source stream.
    pub source_sequence_number: Option<u64>,
}

/// A routing decision: which instance, and as what internal event.
///
/// One external event maps to at most one internal event per event type.
/// Mapping one external event to two internal events of the *same* type
/// would collide on the derived id, so rules return a single mapping.
#[derive(Debug, Clone)]
pub struct Routed {
    /// Correlation id of the target instance.
    pub correlation_id: String,
    /// Internal event type to append.
    pub event_type: String,
    /// Internal event payload.
    pub payload: Value,
}

type RouteRule = Arc<dyn Fn(&ExternalEvent, &DeliveryMetadata) -> Option<Routed> + Send + Sync>;

/// Maps external events to `(correlation id, internal event draft)` pairs.
///
/// Built once per runtime; rules are pure functions of the external event.
#[derive(Clone, Default)]
pub struct CorrelationRouter {
    rules: HashMap<String, RouteRule>,
}

impl CorrelationRouter {
    /// An empty router that subscribes to nothing.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the rule for one external event type.
    ///
    /// Registering the same type twice replaces the earlier rule.
    pub fn on(
        mut self,
        external_event_type: &str,
        rule: impl Fn(&ExternalEvent, &DeliveryMetadata) -> Option<Routed> + Send + Sync + 'static,
    ) -> Self {
        self.rules
            .insert(external_event_type.to_string(), Arc::new(rule));
        self
    }

    /// Route one external event.
    ///
    /// Returns `None` for unsubscribed event types and for events the rule
    /// filters out. The draft's id is derived from the external event id
    /// and the internal event type, so re-routing a redelivered external
    /// event produces the identical draft. Rules must be deterministic in
    /// `(event, metadata)`; ingestion idempotence depends on it.
    pub fn route(
        &self,
        event: &ExternalEvent,
        metadata: &DeliveryMetadata,
    ) -> Option<(String, EventDraft)> {
        let rule = self.rules.get(&event.event_type)?;
        let routed = rule(event, metadata)?;
        let draft = EventDraft::derived(event.id, routed.event_type, routed.payload);
        Some((routed.correlation_id, draft))
    }

    /// Whether any rule is registered for `external_event_type`.
    pub fn subscribes_to(&self, external_event_type: &str) -> bool {
        self.rules.contains_key(external_event_type)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::derive_event_id;
    use serde_json::json;

    fn router() -> CorrelationRouter {
        CorrelationRouter::new().on("ParkingSessionStarted", |event, _metadata| {
            let vehicle = event.payload.get("vehicleId")?.as_str()?;
            let car_park = event.payload.get("carParkId")?.as_str()?;
            if event.payload.get("test").is_some() {
                return None;
            }
            Some(Routed {
                correlation_id: format!("{vehicle}-{car_park}"),
                event_type: "ParkingSessionQueued".to_string(),
                payload: event.payload.clone(),
            })
        })
    }

    fn metadata() -> DeliveryMetadata {
        DeliveryMetadata::default()
    }

    fn external(payload: Value) -> ExternalEvent {
        ExternalEvent {
            id: Uuid::new_v4(),
            event_type: "ParkingSessionStarted".to_string(),
            payload,
        }
    }

    #[test]
    fn routes_subscribed_event_to_correlated_draft() {
        let event = external(json!({"vehicleId": "v-1", "carParkId": "cp-9"}));
        let (correlation_id, draft) = router().route(&event, &metadata()).expect("should route");

        assert_eq!(correlation_id, "v-1-cp-9");
        assert_eq!(draft.event_type, "ParkingSessionQueued");
        assert_eq!(draft.id, derive_event_id(event.id, "ParkingSessionQueued"));
        assert_eq!(draft.source_event_id, event.id);
    }

    #[test]
    fn routing_is_deterministic_across_redelivery() {
        let event = external(json!({"vehicleId": "v-1", "carParkId": "cp-9"}));
        let (_, first) = router().route(&event, &metadata()).expect("should route");
        let (_, second) = router().route(&event, &metadata()).expect("should route");
        assert_eq!(first.id, second.id);
    }

    #[test]
    fn unsubscribed_event_type_is_not_routed() {
        let event = ExternalEvent {
            id: Uuid::new_v4(),
            event_type: "SomethingElse".to_string(),
            payload: Value::Null,
        };
        assert!(router().route(&event, &metadata()).is_none());
        assert!(!router().subscribes_to("SomethingElse"));
        assert!(router().subscribes_to("ParkingSessionStarted"));
    }

    #[test]
    fn rule_can_filter_individual_events() {
        let event = external(json!({"vehicleId": "v-1", "carParkId": "cp-9", "test": true}));
        assert!(router().route(&event, &metadata()).is_none());
    }

    #[test]
    fn rule_can_use_delivery_metadata() {
        let router = CorrelationRouter::new().on("ParkingSessionStarted", |event, metadata| {
            Some(Routed {
                correlation_id: metadata.source_correlation_id.clone()?,
                event_type: "ParkingSessionQueued".to_string(),
                payload: event.payload.clone(),
            })
        });

        let event = external(Value::Null);
        let with_source = DeliveryMetadata {
            source_correlation_id: Some("stream-7".to_string()),
            source_sequence_number: Some(42),
        };
        let (correlation_id, _) = router.route(&event, &with_source).expect("should route");
        assert_eq!(correlation_id, "stream-7");

        // Without a source correlation id the rule filters the event out.
        assert!(router.route(&event, &metadata()).is_none());
    }

    #[test]
    fn later_rule_replaces_earlier_for_same_type() {
        let router = router().on("ParkingSessionStarted", |event, _metadata| {
            Some(Routed {
                correlation_id: "fixed".to_string(),
                event_type: "Replaced".to_string(),
                payload: event.payload.clone(),
            })
        });
        let (correlation_id, draft) = router
            .route(&external(json!({})), &metadata())
            .expect("should route via replacement rule");
        assert_eq!(correlation_id, "fixed");
        assert_eq!(draft.event_type, "Replaced");
    }
}
