//! Tests for the Message derive macro.

use herald_core::Message;
use herald_derive::Message;
use uuid::Uuid;

/// Topic name derived from the type name.
#[derive(Debug, serde::Serialize, serde::Deserialize, Message)]
struct OrderPlaced {
    #[message(key)]
    order_id: Uuid,
    total: u64,
}

#[test]
fn topic_name_is_kebab_case_type_name() {
    assert_eq!(OrderPlaced::topic_name(), "order-placed");
}

#[test]
fn key_is_the_marked_field() {
    let order_id = Uuid::new_v4();
    let message = OrderPlaced {
        order_id,
        total: 10,
    };
    assert_eq!(message.idempotency_key(), order_id.to_string());
}

/// Explicit topic name.
#[derive(Debug, serde::Serialize, serde::Deserialize, Message)]
#[message(topic = "billing.invoices")]
struct InvoiceIssued {
    number: u32,
    #[message(key)]
    reference: String,
}

#[test]
fn custom_topic_name() {
    assert_eq!(InvoiceIssued::topic_name(), "billing.invoices");
    let message = InvoiceIssued {
        number: 1,
        reference: "INV-1".to_string(),
    };
    assert_eq!(message.idempotency_key(), "INV-1");
}

/// Tuple struct keyed by its second field.
#[derive(Debug, serde::Serialize, serde::Deserialize, Message)]
struct Heartbeat(String, #[message(key)] u64);

#[test]
fn tuple_struct_key() {
    assert_eq!(Heartbeat::topic_name(), "heartbeat");
    assert_eq!(Heartbeat("node-a".to_string(), 7).idempotency_key(), "7");
}
