mod message;

/// Derive macro implementing `herald_core::Message` for a struct.
///
/// The topic name defaults to the kebab-case type name, and the idempotency key is the
/// `ToString` rendering of the one field marked `#[message(key)]`.
///
/// # Basic Usage
///
/// ```ignore
/// use herald_derive::Message;
///
/// #[derive(serde::Serialize, serde::Deserialize, Message)]
/// struct OrderPlaced {
///     #[message(key)]
///     order_id: uuid::Uuid,
///     total: u64,
/// }
///
/// assert_eq!(OrderPlaced::topic_name(), "order-placed");
/// ```
///
/// # Custom Topic
///
/// ```ignore
/// #[derive(serde::Serialize, serde::Deserialize, Message)]
/// #[message(topic = "billing.invoices")]
/// struct InvoiceIssued {
///     #[message(key)]
///     number: String,
/// }
///
/// // Returns "billing.invoices"
/// InvoiceIssued::topic_name();
/// ```
///
/// Tuple structs mark the key the same way: `struct Ping(#[message(key)] u64);`
#[proc_macro_derive(Message, attributes(message))]
pub fn message(item: proc_macro::TokenStream) -> proc_macro::TokenStream {
    message::message_impl(item)
}
