//! Typed broker wire records.
//!
//! The broker API reports everything as loosely-typed JSON; these records
//! validate the fields the engine relies on once, at the boundary.

use serde::{Deserialize, Serialize};

/// Order status reported by the broker for a fully filled order.
pub const ORDER_STATUS_COMPLETE: &str = "COMPLETE";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TransactionType {
    Buy,
    Sell,
}

impl TransactionType {
    pub fn opposite(self) -> Self {
        match self {
            TransactionType::Buy => TransactionType::Sell,
            TransactionType::Sell => TransactionType::Buy,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TransactionType::Buy => "BUY",
            TransactionType::Sell => "SELL",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "BUY" => Some(TransactionType::Buy),
            "SELL" => Some(TransactionType::Sell),
            _ => None,
        }
    }
}

impl std::fmt::Display for TransactionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Account margins, `equity` segment only.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Margins {
    #[serde(default)]
    pub equity: SegmentMargins,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SegmentMargins {
    #[serde(default)]
    pub available: AvailableMargins,
    #[serde(default)]
    pub utilised: UtilisedMargins,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AvailableMargins {
    #[serde(default)]
    pub opening_balance: f64,
    #[serde(default)]
    pub collateral: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UtilisedMargins {
    #[serde(default)]
    pub debits: f64,
}

impl Margins {
    /// Total account equity: opening balance + collateral - blocked margin.
    /// Drops on entry by the margin blocked, rises on exit by the margin
    /// released plus mark-to-market.
    pub fn total_equity(&self) -> f64 {
        self.equity.available.opening_balance + self.equity.available.collateral
            - self.equity.utilised.debits
    }
}

/// A master order as reported by the broker order list.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Order {
    pub order_id: String,
    pub status: String,
    pub tradingsymbol: String,
    pub instrument_token: i64,
    #[serde(default)]
    pub exchange: String,
    #[serde(default)]
    pub product: String,
    pub transaction_type: TransactionType,
    pub quantity: i64,
    #[serde(default)]
    pub average_price: f64,
}

impl Order {
    pub fn is_complete(&self) -> bool {
        self.status == ORDER_STATUS_COMPLETE
    }
}

/// A net position as reported by the broker positions endpoint.
///
/// `exchange` and `product` are carried when the broker reports them so
/// synthesized close-all orders can reuse them instead of assuming defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub instrument_token: i64,
    pub quantity: i64,
    pub tradingsymbol: String,
    #[serde(default)]
    pub exchange: Option<String>,
    #[serde(default)]
    pub product: Option<String>,
    #[serde(default)]
    pub pnl: f64,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PositionsData {
    #[serde(default)]
    pub net: Vec<Position>,
}

/// Parameters for placing an order.
#[derive(Debug, Clone, Serialize)]
pub struct OrderParams {
    pub tradingsymbol: String,
    pub exchange: String,
    pub transaction_type: TransactionType,
    pub quantity: i64,
    pub order_type: String,
    pub product: String,
    pub variety: String,
}

impl OrderParams {
    /// A regular market order, the only order type the engine places.
    pub fn market(
        tradingsymbol: &str,
        exchange: &str,
        transaction_type: TransactionType,
        quantity: i64,
        product: &str,
    ) -> Self {
        Self {
            tradingsymbol: tradingsymbol.to_string(),
            exchange: exchange.to_string(),
            transaction_type,
            quantity,
            order_type: "MARKET".to_string(),
            product: product.to_string(),
            variety: "regular".to_string(),
        }
    }
}

/// Token-exchange response payload.
#[derive(Debug, Clone, Deserialize)]
pub struct SessionData {
    pub access_token: String,
    #[serde(default)]
    pub user_id: Option<String>,
}
