//! Decoding of relayed frames on the display side.
//!
//! The relay itself never looks inside a payload. A sink tells ticker rows
//! from arbitrage rows with the `kind` tag of the envelope; raw frames from the
//! exchange (the Binance all-market ticker array) are ticker rows.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value;


/// One row of the price grid.
#[derive(Serialize, Deserialize, PartialEq, Debug, Clone)]
pub struct TickerRow {
    pub sym: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quote: Option<String>,
    pub bid: Decimal,
    pub bidqty: Decimal,
    pub ask: Decimal,
    pub askqty: Decimal,
}

/// One row of the cross-venue arbitrage grid.
#[derive(Serialize, Deserialize, PartialEq, Debug, Clone)]
pub struct ArbitrageRow {
    pub base: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pbid: Option<Decimal>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pask: Option<Decimal>,
    pub minasksym: String,
    pub maxasksym: String,
}

/// A decoded frame.
#[derive(Serialize, Deserialize, PartialEq, Debug, Clone)]
#[serde(tag = "kind", content = "rows", rename_all = "snake_case")]
pub enum FeedMessage {
    Ticker(Vec<TickerRow>),
    Arbitrage(Vec<ArbitrageRow>),
}

/// Entry of the Binance `!ticker@arr` stream. Only the top of book is kept.
#[derive(Deserialize, Debug)]
struct BinanceTicker {
    #[serde(rename = "s")]
    symbol: String,
    #[serde(rename = "b")]
    bid: Decimal,
    #[serde(rename = "B")]
    bid_qty: Decimal,
    #[serde(rename = "a")]
    ask: Decimal,
    #[serde(rename = "A")]
    ask_qty: Decimal,
}

impl From<BinanceTicker> for TickerRow {
    fn from(value: BinanceTicker) -> Self {
        TickerRow {
            sym: value.symbol,
            quote: None,
            bid: value.bid,
            bidqty: value.bid_qty,
            ask: value.ask,
            askqty: value.ask_qty,
        }
    }
}

impl FeedMessage {
    /// Decode a relayed text frame.
    ///
    /// # Arguments
    ///
    /// * `text` - The frame. A JSON string holding JSON is unwrapped first, as
    /// some producers encode their rows twice.
    ///
    /// # Returns
    ///
    /// The tagged message, or the [serde_json error](serde_json::Error) if the frame
    /// is neither a tagged envelope nor an exchange ticker array.
    pub fn decode(text: &str) -> serde_json::Result<FeedMessage> {
        let value = match serde_json::from_str::<Value>(text)? {
            Value::String(inner) => serde_json::from_str::<Value>(&inner)?,
            other => other,
        };
        if value.is_array() {
            let tickers: Vec<BinanceTicker> = serde_json::from_value(value)?;
            Ok(FeedMessage::Ticker(tickers.into_iter().map(|t| t.into()).collect()))
        } else {
            serde_json::from_value(value)
        }
    }

    pub fn encode(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    pub fn len(&self) -> usize {
        match self {
            FeedMessage::Ticker(rows) => rows.len(),
            FeedMessage::Arbitrage(rows) => rows.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
