//! Instrument quantization rules.

use crate::broker::types::Order;
use std::collections::HashMap;
use tracing::debug;

/// Lot size for a trading symbol.
///
/// Table policy: index derivative symbols (anything containing "NIFTY",
/// which also covers BANKNIFTY/FINNIFTY) use the configured index lot size;
/// equities trade in single units. Known limitation: lot sizes should come
/// from the broker's instruments catalogue per instrument.
pub fn lot_size(tradingsymbol: &str, index_lot_size: i64) -> i64 {
    if tradingsymbol.contains("NIFTY") {
        index_lot_size.max(1)
    } else {
        1
    }
}

/// Collapse split fills into one order per logical position.
///
/// A single master entry is often reported as several partial fills; scaling
/// each fill independently floors each one and systematically undersizes the
/// children. Orders are merged by (instrument, side, product, exchange,
/// symbol) with quantities summed, preserving first-seen order.
pub fn aggregate_orders(orders: &[Order]) -> Vec<Order> {
    let mut index: HashMap<(i64, &str, &str, &str, &str), usize> = HashMap::new();
    let mut aggregated: Vec<Order> = Vec::with_capacity(orders.len());

    for order in orders {
        let key = (
            order.instrument_token,
            order.transaction_type.as_str(),
            order.product.as_str(),
            order.exchange.as_str(),
            order.tradingsymbol.as_str(),
        );
        match index.get(&key) {
            Some(&i) => aggregated[i].quantity += order.quantity,
            None => {
                index.insert(key, aggregated.len());
                aggregated.push(order.clone());
            }
        }
    }

    if aggregated.len() != orders.len() {
        debug!(
            fills = orders.len(),
            positions = aggregated.len(),
            "aggregated split fills"
        );
    }
    aggregated
}
