//! Inbound order records pushed over the realtime channel.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// An order offered to the courier.
///
/// Opaque apart from its `orderId`; every other field is carried through as-is.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Order {
    pub order_id: String,
    #[serde(flatten)]
    pub details: Map<String, Value>,
}

impl Order {
    /// Parses an order from a realtime event payload.
    ///
    /// # Errors
    /// Returns an error if the payload is not an object with a string `orderId`.
    pub fn from_value(value: Value) -> Result<Self, serde_json::Error> {
        serde_json::from_value(value)
    }

    pub fn field(&self, key: &str) -> Option<&Value> {
        self.details.get(key)
    }
}
