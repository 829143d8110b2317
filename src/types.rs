// =============================================================================
// Exchange record types — 24h ticker summaries and aggregate trades
// =============================================================================
//
// Binance delivers numeric values as JSON strings inside stream payloads, so
// all price/quantity fields go through a string-or-number deserializer.
//
// Frames arrive in two shapes and both are accepted:
//   - combined-stream envelope: { "stream": "...", "data": ... }
//   - bare payload (array of tickers, or a single trade object)
// =============================================================================

use anyhow::{Context, Result};
use serde::{Deserialize, Deserializer};

// ---------------------------------------------------------------------------
// String-or-number f64 fields
// ---------------------------------------------------------------------------

/// Deserialize an f64 that may be encoded as a JSON string or a number.
fn string_f64<'de, D>(deserializer: D) -> std::result::Result<f64, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw<'a> {
        Str(&'a str),
        Num(f64),
    }

    match Raw::deserialize(deserializer)? {
        Raw::Str(s) => s.parse::<f64>().map_err(serde::de::Error::custom),
        Raw::Num(n) => Ok(n),
    }
}

// ---------------------------------------------------------------------------
// Ticker summary (!ticker@arr element)
// ---------------------------------------------------------------------------

/// One symbol's entry from the all-market 24h rolling ticker stream.
///
/// A `Default` value (with `event_time == 0`) doubles as the end-of-batch
/// sentinel consumed by the runner's worker pool.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TickerSummary {
    #[serde(rename = "s", default)]
    pub symbol: String,

    /// Event time in milliseconds since the epoch.
    #[serde(rename = "E", default)]
    pub event_time: i64,

    #[serde(rename = "c", deserialize_with = "string_f64", default)]
    pub current_day_close: f64,

    #[serde(rename = "b", deserialize_with = "string_f64", default)]
    pub bid: f64,

    #[serde(rename = "a", deserialize_with = "string_f64", default)]
    pub ask: f64,

    #[serde(rename = "h", deserialize_with = "string_f64", default)]
    pub high_price: f64,

    #[serde(rename = "l", deserialize_with = "string_f64", default)]
    pub low_price: f64,

    /// Total traded quote asset volume over the rolling 24h window.
    #[serde(rename = "q", deserialize_with = "string_f64", default)]
    pub total_quote_volume: f64,

    /// 24h price change percent as reported by the exchange.
    #[serde(rename = "P", deserialize_with = "string_f64", default)]
    pub price_change_percent: f64,
}

impl TickerSummary {
    /// Event time in milliseconds.
    pub fn timestamp_ms(&self) -> i64 {
        self.event_time
    }
}

// ---------------------------------------------------------------------------
// Aggregate trade (<symbol>@aggTrade)
// ---------------------------------------------------------------------------

/// A coalesced public trade event for one symbol.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AggTrade {
    #[serde(rename = "s", default)]
    pub symbol: String,

    /// Stream event time in milliseconds.
    #[serde(rename = "E", default)]
    pub event_time: i64,

    /// Trade time in milliseconds. This is the canonical timestamp.
    #[serde(rename = "T", default)]
    pub trade_time: i64,

    #[serde(rename = "p", deserialize_with = "string_f64", default)]
    pub price: f64,

    /// Quantity in the base asset.
    #[serde(rename = "q", deserialize_with = "string_f64", default)]
    pub quantity: f64,

    /// True when the buyer was the maker, i.e. the aggressor sold.
    #[serde(rename = "m", default)]
    pub buyer_maker: bool,
}

impl AggTrade {
    /// Trade time in milliseconds, falling back to the stream event time for
    /// records that carry no trade time.
    pub fn timestamp_ms(&self) -> i64 {
        if self.trade_time != 0 {
            self.trade_time
        } else {
            self.event_time
        }
    }

    /// Traded volume in the quote asset.
    pub fn quote_quantity(&self) -> f64 {
        self.price * self.quantity
    }
}

// ---------------------------------------------------------------------------
// Frame decoding
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
struct TickerEnvelope {
    #[allow(dead_code)]
    stream: Option<String>,
    data: Vec<TickerSummary>,
}

#[derive(Deserialize)]
struct TradeEnvelope {
    #[allow(dead_code)]
    stream: Option<String>,
    data: AggTrade,
}

/// Decode a ticker frame: either a combined-stream envelope whose `data` is
/// the ticker array, or the bare array itself.
pub fn decode_ticker_frame(buf: &[u8]) -> Result<Vec<TickerSummary>> {
    if let Ok(envelope) = serde_json::from_slice::<TickerEnvelope>(buf) {
        return Ok(envelope.data);
    }
    serde_json::from_slice::<Vec<TickerSummary>>(buf).context("failed to decode ticker frame")
}

/// Decode an aggregate-trade frame: a combined-stream envelope carrying one
/// trade record, or the bare record.
pub fn decode_trade_frame(buf: &[u8]) -> Result<AggTrade> {
    if let Ok(envelope) = serde_json::from_slice::<TradeEnvelope>(buf) {
        return Ok(envelope.data);
    }
    serde_json::from_slice::<AggTrade>(buf).context("failed to decode trade frame")
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_bare_ticker_array() {
        let json = r#"[
            { "e": "24hrTicker", "E": 1700000000000, "s": "BTCUSDT",
              "c": "37000.10", "b": "37000.00", "a": "37000.20",
              "h": "37500.00", "l": "36500.00", "q": "123456789.12",
              "P": "1.234" }
        ]"#;
        let tickers = decode_ticker_frame(json.as_bytes()).expect("should decode");
        assert_eq!(tickers.len(), 1);
        let t = &tickers[0];
        assert_eq!(t.symbol, "BTCUSDT");
        assert_eq!(t.event_time, 1_700_000_000_000);
        assert!((t.current_day_close - 37000.10).abs() < 1e-9);
        assert!((t.price_change_percent - 1.234).abs() < 1e-9);
    }

    #[test]
    fn decode_enveloped_ticker_array() {
        let json = r#"{
            "stream": "!ticker@arr",
            "data": [
                { "E": 1700000001000, "s": "ETHUSDT", "c": "2000.5",
                  "b": "2000.4", "a": "2000.6", "h": "2100", "l": "1900",
                  "q": "99.5", "P": "-0.5" }
            ]
        }"#;
        let tickers = decode_ticker_frame(json.as_bytes()).expect("should decode");
        assert_eq!(tickers.len(), 1);
        assert_eq!(tickers[0].symbol, "ETHUSDT");
        assert!((tickers[0].low_price - 1900.0).abs() < f64::EPSILON);
    }

    #[test]
    fn decode_enveloped_trade() {
        let json = r#"{
            "stream": "btcusdt@aggTrade",
            "data": { "e": "aggTrade", "E": 1700000002000, "s": "BTCUSDT",
                      "a": 42, "p": "37000.00", "q": "0.125",
                      "f": 1, "l": 2, "T": 1700000001987, "m": true }
        }"#;
        let trade = decode_trade_frame(json.as_bytes()).expect("should decode");
        assert_eq!(trade.symbol, "BTCUSDT");
        assert_eq!(trade.timestamp_ms(), 1_700_000_001_987);
        assert!(trade.buyer_maker);
        assert!((trade.quote_quantity() - 4625.0).abs() < 1e-9);
    }

    #[test]
    fn decode_garbage_is_error() {
        assert!(decode_ticker_frame(b"not json").is_err());
        assert!(decode_trade_frame(b"{\"data\": 12}").is_err());
    }

    #[test]
    fn default_ticker_is_sentinel() {
        let t = TickerSummary::default();
        assert_eq!(t.event_time, 0);
        assert!(t.symbol.is_empty());
    }

    #[test]
    fn numeric_fields_accept_numbers() {
        // Some gateways re-encode strings as numbers; both must parse.
        let json = r#"[{ "E": 1, "s": "X", "c": 1.5, "b": 1.4, "a": 1.6,
                         "h": 2.0, "l": 1.0, "q": 10.0, "P": 0.1 }]"#;
        let tickers = decode_ticker_frame(json.as_bytes()).expect("should decode");
        assert!((tickers[0].current_day_close - 1.5).abs() < f64::EPSILON);
    }
}
