//! Fiat rate tickers keyed by Unix time.

use blockdex_core::error::BlockdexError;
use blockdex_core::pack::{pack_u32_be, unpack_u32_be};
use blockdex_core::types::FiatTicker;

use crate::index::{Indexer, IterControl};
use crate::store::{Column, IterFrom};

fn ticker_key(ts: i64) -> Result<[u8; 4], BlockdexError> {
    u32::try_from(ts)
        .map(pack_u32_be)
        .map_err(|_| BlockdexError::Codec(format!("ticker timestamp {ts} out of range")))
}

fn unpack_ticker(k: &[u8], v: &[u8]) -> Result<FiatTicker, BlockdexError> {
    let mut t: FiatTicker = serde_json::from_slice(v).map_err(|e| BlockdexError::Codec(e.to_string()))?;
    t.timestamp = unpack_u32_be(k)? as i64;
    Ok(t)
}

impl Indexer {
    pub fn store_ticker(&self, ticker: &FiatTicker) -> Result<(), BlockdexError> {
        if ticker.rates.is_empty() {
            return Err(BlockdexError::Codec("ticker has no rates".into()));
        }
        let v = serde_json::to_vec(ticker).map_err(|e| BlockdexError::Codec(e.to_string()))?;
        self.store.put(Column::FiatRates, &ticker_key(ticker.timestamp)?, &v)
    }

    /// Ticker stored at exactly `ts`.
    pub fn get_ticker(&self, ts: i64) -> Result<Option<FiatTicker>, BlockdexError> {
        let key = ticker_key(ts)?;
        match self.store.get(Column::FiatRates, &key)? {
            Some(v) => Ok(Some(unpack_ticker(&key, &v)?)),
            None => Ok(None),
        }
    }

    /// First ticker at or after `ts` carrying `currency`; any ticker if
    /// `currency` is empty.
    pub fn find_ticker(&self, ts: i64, currency: &str) -> Result<Option<FiatTicker>, BlockdexError> {
        let start = ticker_key(ts.max(0))?;
        for item in self.store.iter(Column::FiatRates, IterFrom::Forward(&start))? {
            let (k, v) = item?;
            let t = unpack_ticker(&k, &v)?;
            if currency.is_empty() || t.has_currency(currency) {
                return Ok(Some(t));
            }
        }
        Ok(None)
    }

    /// Newest ticker carrying `currency`; the newest overall if empty.
    pub fn find_last_ticker(&self, currency: &str) -> Result<Option<FiatTicker>, BlockdexError> {
        for item in self.store.iter(Column::FiatRates, IterFrom::End)? {
            let (k, v) = item?;
            let t = unpack_ticker(&k, &v)?;
            if currency.is_empty() || t.has_currency(currency) {
                return Ok(Some(t));
            }
        }
        Ok(None)
    }

    /// Visit tickers in `from..=to`, ascending.
    pub fn iterate_tickers<F>(&self, from: i64, to: i64, mut f: F) -> Result<(), BlockdexError>
    where
        F: FnMut(FiatTicker) -> Result<IterControl, BlockdexError>,
    {
        let start = ticker_key(from.max(0))?;
        for item in self.store.iter(Column::FiatRates, IterFrom::Forward(&start))? {
            let (k, v) = item?;
            let t = unpack_ticker(&k, &v)?;
            if t.timestamp > to || f(t)? == IterControl::Stop {
                break;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::temp_indexer;
    use std::collections::BTreeMap;

    fn ticker(ts: i64, rates: &[(&str, f64)]) -> FiatTicker {
        FiatTicker {
            timestamp: ts,
            rates: rates.iter().map(|(c, r)| (c.to_string(), *r)).collect(),
            token_rates: BTreeMap::new(),
        }
    }

    #[test]
    fn empty_rates_rejected() {
        let (ix, _dir) = temp_indexer();
        assert!(ix.store_ticker(&ticker(100, &[])).is_err());
    }

    #[test]
    fn find_ticker_skips_missing_currency() {
        let (ix, _dir) = temp_indexer();
        ix.store_ticker(&ticker(100, &[("usd", 1.0)])).unwrap();
        ix.store_ticker(&ticker(200, &[("usd", 2.0), ("eur", 1.5)])).unwrap();
        ix.store_ticker(&ticker(300, &[("usd", 3.0)])).unwrap();

        assert_eq!(ix.get_ticker(200).unwrap().unwrap().rates["eur"], 1.5);
        assert!(ix.get_ticker(150).unwrap().is_none());
        assert_eq!(ix.find_ticker(150, "usd").unwrap().unwrap().timestamp, 200);
        assert_eq!(ix.find_ticker(50, "eur").unwrap().unwrap().timestamp, 200);
        assert!(ix.find_ticker(250, "eur").unwrap().is_none());
        assert_eq!(ix.find_last_ticker("eur").unwrap().unwrap().timestamp, 200);
        assert_eq!(ix.find_last_ticker("").unwrap().unwrap().timestamp, 300);
    }

    #[test]
    fn iterate_tickers_respects_bounds() {
        let (ix, _dir) = temp_indexer();
        for ts in [10, 20, 30, 40] {
            ix.store_ticker(&ticker(ts, &[("usd", ts as f64)])).unwrap();
        }
        let mut seen = Vec::new();
        ix.iterate_tickers(15, 35, |t| {
            seen.push(t.timestamp);
            Ok(IterControl::Continue)
        })
        .unwrap();
        assert_eq!(seen, vec![20, 30]);
    }
}
