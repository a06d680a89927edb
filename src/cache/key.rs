use serde::{Deserialize, Serialize};
use std::fmt;

/// Hierarchical cache key, e.g. `["orders", "order-1"]`.
///
/// Invalidation and refetch operate on prefixes: `["orders"]` matches every
/// key that starts with `"orders"`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct QueryKey(Vec<String>);

impl QueryKey {
    pub fn new<I, S>(segments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(segments.into_iter().map(Into::into).collect())
    }

    pub fn segments(&self) -> &[String] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Whether `prefix` is a leading run of this key's segments
    pub fn starts_with(&self, prefix: &QueryKey) -> bool {
        self.0.starts_with(&prefix.0)
    }

    /// New key with one more segment
    pub fn child<S: Into<String>>(&self, segment: S) -> Self {
        let mut segments = self.0.clone();
        segments.push(segment.into());
        Self(segments)
    }
}

impl fmt::Display for QueryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}]", self.0.join(", "))
    }
}

impl<const N: usize> From<[&str; N]> for QueryKey {
    fn from(segments: [&str; N]) -> Self {
        Self::new(segments)
    }
}

impl From<&[&str]> for QueryKey {
    fn from(segments: &[&str]) -> Self {
        Self::new(segments.iter().copied())
    }
}

impl From<Vec<String>> for QueryKey {
    fn from(segments: Vec<String>) -> Self {
        Self(segments)
    }
}

/// Keys used for DocFiscal orders and payments
pub mod query_keys {
    use super::QueryKey;

    /// Root of every order query, including the order list
    pub fn orders() -> QueryKey {
        QueryKey::from(["orders"])
    }

    pub fn order(order_id: &str) -> QueryKey {
        orders().child(order_id)
    }

    pub fn payments() -> QueryKey {
        QueryKey::from(["payments"])
    }

    pub fn payment(payment_id: &str) -> QueryKey {
        payments().child(payment_id)
    }

    pub fn payment_status(payment_id: &str) -> QueryKey {
        payment(payment_id).child("status")
    }
}
