//! Lock key naming.
//!
//! ```text
//! saga:lock:order:<orderId>:payment
//! saga:lock:order:<orderId>:order
//! saga:lock:saga:<sagaId>
//! ```

pub const LOCK_PREFIX: &str = "saga:lock:";

/// Key guarding payment commands for an order.
pub fn payment_lock_key(order_id: i64) -> String {
    format!("{LOCK_PREFIX}order:{order_id}:payment")
}

/// Key guarding order-status commands for an order.
pub fn order_lock_key(order_id: i64) -> String {
    format!("{LOCK_PREFIX}order:{order_id}:order")
}

/// Key guarding a whole saga instance.
pub fn saga_lock_key(saga_id: &str) -> String {
    format!("{LOCK_PREFIX}saga:{saga_id}")
}
