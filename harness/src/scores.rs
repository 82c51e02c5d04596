use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{SecondsFormat, Utc};
use tracing::debug;

use crate::error::HarnessError;
use crate::rate_cache::FeeRates;

/// How many future blocks each prediction is graded against.
pub const SCORE_LOOKAHEAD: u64 = 10;

struct ScoreRow {
    /// Percentage of the future block's txs that paid more than the
    /// predicted rate, one value per slot.
    per_slot: Vec<f64>,
    #[allow(dead_code)]
    number_of_txs: usize,
}

struct Prediction {
    /// Predicted rates in sat/B, one per slot.
    rates: Vec<f64>,
    /// Actual feerate distribution of the block at this height.
    actual: Arc<FeeRates>,
    /// future height -> score.
    scores: BTreeMap<u64, ScoreRow>,
}

/// Records per-block predictions and grades them against the actual feerate
/// distributions of the following blocks.
///
/// The scorer performs no prediction itself; slot names and count are
/// configured per estimator (a single "Standard" slot for the one-shot
/// estimators, economical/standard/fast for the rest).
pub struct PredictionScorer {
    name: &'static str,
    slots: &'static [&'static str],
    output_dir: PathBuf,
    predictions: BTreeMap<u64, Prediction>,
}

impl PredictionScorer {
    pub fn new(name: &'static str, slots: &'static [&'static str], output_dir: PathBuf) -> Self {
        PredictionScorer {
            name,
            slots,
            output_dir,
            predictions: BTreeMap::new(),
        }
    }

    /// Record a prediction made while `height` was the best block, together
    /// with that block's actual feerate distribution.
    pub fn add_prediction(&mut self, height: u64, actual: Arc<FeeRates>, rates: Vec<f64>) {
        assert_eq!(
            rates.len(),
            self.slots.len(),
            "one predicted rate per slot expected"
        );
        self.predictions.insert(
            height,
            Prediction {
                rates,
                actual,
                scores: BTreeMap::new(),
            },
        );
    }

    /// Score every prediction against the recorded blocks following it, then
    /// write the CSV out.
    pub fn score_and_flush(&mut self) -> Result<(), HarnessError> {
        self.score_against_future();
        self.flush()
    }

    fn score_against_future(&mut self) {
        let heights: Vec<u64> = self.predictions.keys().copied().collect();
        for height in heights {
            for target in (height + 1)..=(height + SCORE_LOOKAHEAD) {
                let scored = self.predictions[&height].scores.contains_key(&target);
                if scored {
                    continue;
                }
                // A score exists iff a prediction was recorded at the target
                // height; its distribution is what we grade against.
                let Some(target_pred) = self.predictions.get(&target) else {
                    continue;
                };
                let actual = target_pred.actual.clone();
                let number_of_txs = actual.number_of_txs;

                let pred = self.predictions.get_mut(&height).expect("height exists");
                let per_slot = pred
                    .rates
                    .iter()
                    .map(|rate| percentile_above(&actual.rates, *rate))
                    .collect();
                pred.scores.insert(
                    target,
                    ScoreRow {
                        per_slot,
                        number_of_txs,
                    },
                );
            }
        }
    }

    fn flush(&self) -> Result<(), HarnessError> {
        fs::create_dir_all(&self.output_dir)?;
        let timestamp = Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true);
        let path = self
            .output_dir
            .join(format!("{}scores{}.csv", self.name, timestamp));
        let mut out = BufWriter::new(File::create(&path)?);
        self.write_csv(&mut out)?;
        out.flush()?;
        debug!(?path, rows = self.predictions.len(), "flushed prediction scores");
        Ok(())
    }

    fn write_csv<W: Write>(&self, out: &mut W) -> std::io::Result<()> {
        let mut columns = vec!["block_number".to_string()];
        for slot in self.slots {
            columns.push(format!("price{slot}"));
        }
        columns.push("numberOfTxs".to_string());
        for n in 1..=SCORE_LOOKAHEAD {
            for slot in self.slots {
                columns.push(format!("score{slot}Plus{n}"));
            }
        }
        writeln!(out, "{}", columns.join(","))?;

        for (height, pred) in &self.predictions {
            let mut record = vec![height.to_string()];
            for rate in &pred.rates {
                record.push(format!("{rate:.3}"));
            }
            record.push(pred.actual.number_of_txs.to_string());
            for target in (height + 1)..=(height + SCORE_LOOKAHEAD) {
                match pred.scores.get(&target) {
                    Some(row) => {
                        for score in &row.per_slot {
                            record.push(format!("{score:.3}"));
                        }
                    }
                    // Not yet available.
                    None => {
                        for _ in self.slots {
                            record.push("-1".to_string());
                        }
                    }
                }
            }
            writeln!(out, "{}", record.join(","))?;
        }
        Ok(())
    }
}

/// Percentage of `rates` strictly above the predicted value.
fn percentile_above(rates: &[f64], prediction: f64) -> f64 {
    if rates.is_empty() {
        return 0.0;
    }
    let above = rates.iter().filter(|rate| **rate > prediction).count();
    100.0 * above as f64 / rates.len() as f64
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fee_rates(rates: &[f64]) -> Arc<FeeRates> {
        Arc::new(FeeRates {
            rates: rates.to_vec(),
            number_of_txs: rates.len(),
        })
    }

    fn csv_lines(scorer: &PredictionScorer) -> Vec<String> {
        let mut buf = Vec::new();
        scorer.write_csv(&mut buf).unwrap();
        String::from_utf8(buf)
            .unwrap()
            .lines()
            .map(str::to_string)
            .collect()
    }

    #[test]
    fn percentile_counts_strictly_above() {
        assert_eq!(percentile_above(&[5.0, 15.0, 25.0], 10.0), 200.0 / 3.0);
        assert_eq!(percentile_above(&[30.0, 40.0], 10.0), 100.0);
        assert_eq!(percentile_above(&[5.0, 10.0, 15.0, 20.0], 10.0), 50.0);
        assert_eq!(percentile_above(&[1.0, 2.0], 5.0), 0.0);
        assert_eq!(percentile_above(&[], 5.0), 0.0);
    }

    #[test]
    fn predictions_are_scored_against_recorded_futures() {
        let dir = std::env::temp_dir();
        let mut scorer = PredictionScorer::new("test", &["Standard"], dir);

        scorer.add_prediction(100, fee_rates(&[1.0, 2.0]), vec![10.0]);
        scorer.add_prediction(101, fee_rates(&[5.0, 15.0, 25.0]), vec![20.0]);
        scorer.add_prediction(102, fee_rates(&[5.0, 10.0, 15.0, 20.0]), vec![30.0]);
        scorer.add_prediction(103, fee_rates(&[30.0, 40.0]), vec![40.0]);
        scorer.score_against_future();

        let pred = &scorer.predictions[&100];
        let at_101 = pred.scores.get(&101).unwrap();
        assert!((at_101.per_slot[0] - 200.0 / 3.0).abs() < 1e-9);
        let at_102 = pred.scores.get(&102).unwrap();
        assert_eq!(at_102.per_slot[0], 50.0);
        let at_103 = pred.scores.get(&103).unwrap();
        assert_eq!(at_103.per_slot[0], 100.0);
        // No prediction at 104..110: no score rows exist.
        assert!(pred.scores.get(&104).is_none());
    }

    #[test]
    fn csv_emits_sentinels_for_missing_scores() {
        let dir = std::env::temp_dir();
        let mut scorer = PredictionScorer::new("test", &["Standard"], dir);
        scorer.add_prediction(100, fee_rates(&[5.0, 15.0, 25.0]), vec![10.0]);
        scorer.add_prediction(101, fee_rates(&[5.0, 15.0, 25.0]), vec![10.0]);
        scorer.score_against_future();

        let lines = csv_lines(&scorer);
        assert_eq!(
            lines[0],
            "block_number,priceStandard,numberOfTxs,scoreStandardPlus1,scoreStandardPlus2,\
             scoreStandardPlus3,scoreStandardPlus4,scoreStandardPlus5,scoreStandardPlus6,\
             scoreStandardPlus7,scoreStandardPlus8,scoreStandardPlus9,scoreStandardPlus10"
        );
        // Height 100 scored against 101 only; everything else is pending.
        assert_eq!(
            lines[1],
            "100,10.000,3,66.667,-1,-1,-1,-1,-1,-1,-1,-1,-1"
        );
        // Height 101 has no recorded future at all.
        assert_eq!(lines[2], "101,10.000,3,-1,-1,-1,-1,-1,-1,-1,-1,-1,-1");
    }

    #[test]
    fn multi_slot_columns_group_slots_within_each_offset() {
        let dir = std::env::temp_dir();
        let mut scorer =
            PredictionScorer::new("test", &["Economical", "Standard", "Fast"], dir);
        scorer.add_prediction(7, fee_rates(&[1.0]), vec![1.0, 2.0, 3.0]);
        let lines = csv_lines(&scorer);
        assert!(lines[0].starts_with(
            "block_number,priceEconomical,priceStandard,priceFast,numberOfTxs,\
             scoreEconomicalPlus1,scoreStandardPlus1,scoreFastPlus1,scoreEconomicalPlus2"
        ));
        // 1 height column + 3 prices + numberOfTxs + 10 * 3 scores.
        assert_eq!(lines[1].split(',').count(), 35);
    }
}
