//! Type-safe cache key builders

use std::fmt;

pub const VERSION: &str = "v1";

pub mod payment {
    use super::*;

    pub const NAMESPACE: &str = "payment";

    /// Durable outcome record of one order.
    #[derive(Debug, Clone)]
    pub struct OutcomeKey {
        pub order_id: String,
    }

    impl OutcomeKey {
        pub fn new(order_id: impl Into<String>) -> Self {
            Self {
                order_id: order_id.into(),
            }
        }
    }

    impl fmt::Display for OutcomeKey {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "{}:{}:outcome:{}", VERSION, NAMESPACE, self.order_id)
        }
    }

    /// Pub/sub channel carrying every write to one order's record.
    #[derive(Debug, Clone)]
    pub struct OutcomeChannel {
        pub order_id: String,
    }

    impl OutcomeChannel {
        pub fn new(order_id: impl Into<String>) -> Self {
            Self {
                order_id: order_id.into(),
            }
        }
    }

    impl fmt::Display for OutcomeChannel {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "{}:{}:outcome_events:{}", VERSION, NAMESPACE, self.order_id)
        }
    }

    /// Sorted set of pending order ids scored by creation time in millis.
    pub fn pending_index() -> String {
        format!("{}:{}:pending", VERSION, NAMESPACE)
    }
}
