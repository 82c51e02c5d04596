/// Satoshis in one bitcoin.
pub const COIN: f64 = 100_000_000.0;

/// Fee rate in satoshis per 1000 bytes.
///
/// The canonical feerate unit of the estimators. Constructed from an
/// absolute fee and a transaction size; a zero size yields a zero rate.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Default)]
pub struct FeeRate {
    sat_per_kvb: f64,
}

impl FeeRate {
    /// Build a rate from a fee in satoshis and a size in bytes.
    pub fn new(fee_sat: f64, size_bytes: u64) -> Self {
        let sat_per_kvb = if size_bytes > 0 {
            fee_sat * 1000.0 / size_bytes as f64
        } else {
            0.0
        };
        FeeRate { sat_per_kvb }
    }

    pub fn from_sat_per_kvb(sat_per_kvb: f64) -> Self {
        FeeRate { sat_per_kvb }
    }

    pub fn sat_per_kvb(&self) -> f64 {
        self.sat_per_kvb
    }

    pub fn sat_per_byte(&self) -> f64 {
        self.sat_per_kvb / 1000.0
    }

    pub fn btc_per_kvb(&self) -> f64 {
        self.sat_per_kvb / COIN
    }

    /// Fee in satoshis for a transaction of the given size.
    ///
    /// A nonzero rate never quotes a zero fee for a nonzero size: the result
    /// is rounded away from zero to at least one satoshi.
    pub fn fee_for(&self, size_bytes: u64) -> f64 {
        let fee = self.sat_per_kvb * size_bytes as f64 / 1000.0;
        if fee == 0.0 && size_bytes != 0 {
            if self.sat_per_kvb > 0.0 {
                return 1.0;
            }
            if self.sat_per_kvb < 0.0 {
                return -1.0;
            }
        }
        fee
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_from_fee_and_size() {
        let rate = FeeRate::new(500.0, 100);
        assert_eq!(rate.sat_per_kvb(), 5000.0);
        assert_eq!(rate.sat_per_byte(), 5.0);
        assert_eq!(rate.btc_per_kvb(), 5000.0 / COIN);
    }

    #[test]
    fn zero_size_yields_zero_rate() {
        assert_eq!(FeeRate::new(500.0, 0).sat_per_kvb(), 0.0);
    }

    #[test]
    fn fee_for_rounds_away_from_zero() {
        // 1 sat/kvB over 100 bytes would quote 0.1 sat; clamp to 1.
        let rate = FeeRate::from_sat_per_kvb(1.0);
        assert_eq!(rate.fee_for(100), 1.0);
        assert_eq!(rate.fee_for(0), 0.0);
        assert_eq!(FeeRate::from_sat_per_kvb(-1.0).fee_for(100), -1.0);
    }

    #[test]
    fn fee_for_scales_with_size() {
        let rate = FeeRate::from_sat_per_kvb(2000.0);
        assert_eq!(rate.fee_for(1000), 2000.0);
        assert_eq!(rate.fee_for(250), 500.0);
    }
}
