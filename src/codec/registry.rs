use std::collections::HashMap;

use serde_json::Value;

use super::CodecError;
use crate::event::{EventKind, EventPayload, OrderCreated, OrderStatusUpdated};

/// A pure transformation moving a payload from one schema version to the next.
///
/// Upcasters are plain structs with function pointers, returned as static
/// slices from [`EventKind::upcasters`] or added with
/// [`EventRegistry::with_upcaster`].
#[derive(Clone, Copy, Debug)]
pub struct PayloadUpcaster {
    pub event_type: &'static str,
    pub from_version: u32,
    pub to_version: u32,
    pub transform: fn(payload: Value) -> Value,
}

type DecodeFn = fn(Value) -> Result<EventPayload, serde_json::Error>;

struct Entry {
    schema_version: u32,
    decode: DecodeFn,
}

fn decode_as<K: EventKind>(payload: Value) -> Result<EventPayload, serde_json::Error> {
    serde_json::from_value::<K>(payload).map(Into::into)
}

/// Explicit table of decodable event types.
///
/// Decoding never falls back to reflection: an `event_type` missing from the
/// table fails with [`CodecError::UnknownEventType`].
pub struct EventRegistry {
    entries: HashMap<&'static str, Entry>,
    upcasters: Vec<PayloadUpcaster>,
}

impl Default for EventRegistry {
    /// Registry with every event the order service emits.
    fn default() -> Self {
        Self::empty()
            .register::<OrderCreated>()
            .register::<OrderStatusUpdated>()
    }
}

impl EventRegistry {
    pub fn empty() -> Self {
        Self {
            entries: HashMap::new(),
            upcasters: Vec::new(),
        }
    }

    /// Register an event kind together with its declared upcasters.
    pub fn register<K: EventKind>(mut self) -> Self {
        self.entries.insert(
            K::EVENT_TYPE,
            Entry {
                schema_version: K::SCHEMA_VERSION,
                decode: decode_as::<K>,
            },
        );
        self.upcasters.extend_from_slice(K::upcasters());
        self
    }

    pub fn with_upcaster(mut self, upcaster: PayloadUpcaster) -> Self {
        self.upcasters.push(upcaster);
        self
    }

    pub fn contains(&self, event_type: &str) -> bool {
        self.entries.contains_key(event_type)
    }

    /// Current schema version of a registered type.
    pub fn schema_version(&self, event_type: &str) -> Option<u32> {
        self.entries.get(event_type).map(|e| e.schema_version)
    }

    pub fn event_types(&self) -> Vec<&'static str> {
        let mut types: Vec<_> = self.entries.keys().copied().collect();
        types.sort_unstable();
        types
    }

    /// Upcast a payload written at `version` and decode it into its variant.
    pub fn decode_payload(
        &self,
        event_type: &str,
        version: u32,
        payload: Value,
    ) -> Result<EventPayload, CodecError> {
        let entry = self
            .entries
            .get(event_type)
            .ok_or_else(|| CodecError::UnknownEventType(event_type.to_string()))?;

        let payload = self.upcast(event_type, version, entry.schema_version, payload);
        Ok((entry.decode)(payload)?)
    }

    fn upcast(&self, event_type: &str, mut version: u32, target: u32, mut payload: Value) -> Value {
        while version < target {
            let next = self.upcasters.iter().find(|u| {
                u.event_type == event_type && u.from_version == version && u.to_version > version
            });
            match next {
                Some(u) => {
                    payload = (u.transform)(payload);
                    version = u.to_version;
                }
                // Missing steps rely on serde defaults for added fields.
                None => break,
            }
        }
        payload
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{OrderId, OrderStatus, UserId};
    use serde_json::json;

    #[test]
    fn default_registry_knows_order_events() {
        let registry = EventRegistry::default();
        assert_eq!(
            registry.event_types(),
            vec!["OrderCreated", "OrderStatusUpdated"]
        );
        assert_eq!(registry.schema_version("OrderStatusUpdated"), Some(2));
    }

    #[test]
    fn unknown_type_is_rejected() {
        let registry = EventRegistry::default();
        let err = registry
            .decode_payload("UnknownType", 1, json!({}))
            .unwrap_err();
        assert_eq!(err, CodecError::UnknownEventType("UnknownType".into()));
    }

    #[test]
    fn restricted_registry_rejects_unregistered_type() {
        let registry = EventRegistry::empty().register::<OrderCreated>();
        assert!(registry.contains("OrderCreated"));
        assert!(matches!(
            registry.decode_payload("OrderStatusUpdated", 2, json!({})),
            Err(CodecError::UnknownEventType(_))
        ));
    }

    #[test]
    fn chained_upcasters_run_in_version_order() {
        // v0 used "from"/"to", v1 renamed them to old_status/new_status.
        let registry = EventRegistry::default()
            .with_upcaster(PayloadUpcaster {
                event_type: "OrderStatusUpdated",
                from_version: 0,
                to_version: 1,
                transform: |mut payload| {
                    if let Some(obj) = payload.as_object_mut() {
                        if let Some(v) = obj.remove("from") {
                            obj.insert("old_status".into(), v);
                        }
                        if let Some(v) = obj.remove("to") {
                            obj.insert("new_status".into(), v);
                        }
                    }
                    payload
                },
            })
            .with_upcaster(PayloadUpcaster {
                event_type: "OrderStatusUpdated",
                from_version: 1,
                to_version: 2,
                transform: |mut payload| {
                    if let Some(obj) = payload.as_object_mut() {
                        obj.insert("reason".into(), json!("migrated"));
                    }
                    payload
                },
            });

        let order_id = OrderId::new();
        let decoded = registry
            .decode_payload(
                "OrderStatusUpdated",
                0,
                json!({
                    "order_id": order_id,
                    "user_id": UserId::new(),
                    "from": "Created",
                    "to": "Cancelled",
                }),
            )
            .unwrap();

        match decoded {
            EventPayload::OrderStatusUpdated(e) => {
                assert_eq!(e.order_id, order_id);
                assert_eq!(e.old_status, OrderStatus::Created);
                assert_eq!(e.new_status, OrderStatus::Cancelled);
                assert_eq!(e.reason.as_deref(), Some("migrated"));
            }
            other => panic!("unexpected payload {:?}", other),
        }
    }

    #[test]
    fn schema_mismatch_is_serialization_error() {
        let registry = EventRegistry::default();
        let err = registry
            .decode_payload("OrderCreated", 1, json!({ "order_id": 5 }))
            .unwrap_err();
        assert!(matches!(err, CodecError::Serialization(_)));
    }
}
