//! Merged-dataset analysis.
//!
//! Computes per-source volumes, exclusive-orderflow share and pairwise
//! arrival-latency distributions over a merged transaction set plus its
//! sourcelog, and renders a plain-text report.

use std::collections::{BTreeMap, HashMap};

use anyhow::{anyhow, Result};
use chrono::DateTime;
use hdrhistogram::Histogram;

use crate::types::{SourceComp, Sourcelog, TxSummaryEntry};

/// Latency histogram range: 1 ms to 5,000 s, 3 significant figures.
const LATENCY_HIST_MAX_MS: u64 = 5_000_000;
const LATENCY_HIST_SIGFIGS: u8 = 3;

/// Pairwise arrival-latency comparison between two sources, restricted to
/// transactions included on-chain and seen by both.
pub struct LatencyComparison {
    pub source: String,
    pub reference: String,
    /// Δ = reference_ts - source_ts for entries where the source was first.
    pub source_first: Histogram<u64>,
    /// -Δ for entries where the reference was first.
    pub reference_first: Histogram<u64>,
    pub shared_included: u64,
}

pub struct Analyzer<'a> {
    txs: &'a HashMap<String, TxSummaryEntry>,
    sourcelog: &'a Sourcelog,
    comps: Vec<SourceComp>,

    n_unique: i64,
    n_included: i64,
    n_not_included: i64,

    tx_per_source: BTreeMap<String, i64>,
    on_chain_by_source: BTreeMap<String, i64>,
    not_on_chain_by_source: BTreeMap<String, i64>,

    n_exclusive: i64,
    n_exclusive_included: i64,
    n_exclusive_not_included: i64,
    exclusive_included: BTreeMap<String, i64>,
    exclusive_not_included: BTreeMap<String, i64>,

    ts_first: i64,
    ts_last: i64,
}

impl<'a> Analyzer<'a> {
    pub fn new(
        txs: &'a HashMap<String, TxSummaryEntry>,
        sourcelog: &'a Sourcelog,
        comps: Vec<SourceComp>,
    ) -> Self {
        let mut a = Self {
            txs,
            sourcelog,
            comps,
            n_unique: txs.len() as i64,
            n_included: 0,
            n_not_included: 0,
            tx_per_source: BTreeMap::new(),
            on_chain_by_source: BTreeMap::new(),
            not_on_chain_by_source: BTreeMap::new(),
            n_exclusive: 0,
            n_exclusive_included: 0,
            n_exclusive_not_included: 0,
            exclusive_included: BTreeMap::new(),
            exclusive_not_included: BTreeMap::new(),
            // 0 is a legitimate timestamp, so the range starts inverted and
            // only narrows once entries are visited.
            ts_first: i64::MAX,
            ts_last: i64::MIN,
        };
        a.init();
        a
    }

    fn init(&mut self) {
        for tx in self.txs.values() {
            if tx.is_included() {
                self.n_included += 1;
            } else {
                self.n_not_included += 1;
            }

            for src in &tx.sources {
                *self.tx_per_source.entry(src.clone()).or_default() += 1;
                if tx.is_included() {
                    *self.on_chain_by_source.entry(src.clone()).or_default() += 1;
                } else {
                    *self.not_on_chain_by_source.entry(src.clone()).or_default() += 1;
                }
            }

            if tx.sources.len() == 1 {
                let src = &tx.sources[0];
                self.n_exclusive += 1;
                if tx.is_included() {
                    self.n_exclusive_included += 1;
                    *self.exclusive_included.entry(src.clone()).or_default() += 1;
                } else {
                    self.n_exclusive_not_included += 1;
                    *self.exclusive_not_included.entry(src.clone()).or_default() += 1;
                }
            }

            self.ts_first = self.ts_first.min(tx.timestamp_ms);
            self.ts_last = self.ts_last.max(tx.timestamp_ms);
        }
    }

    /// Sorted list of every source tag observed.
    pub fn sources(&self) -> Vec<String> {
        self.tx_per_source.keys().cloned().collect()
    }

    /// Compare arrival times of `comp.source` against `comp.reference`.
    pub fn latency_comp(&self, comp: &SourceComp) -> Result<LatencyComparison> {
        let mut source_first = new_latency_histogram()?;
        let mut reference_first = new_latency_histogram()?;
        let mut shared_included = 0u64;

        for (hash, tx) in self.txs {
            if !tx.is_included() || tx.sources.len() < 2 {
                continue;
            }
            if !tx.has_source(&comp.source) || !tx.has_source(&comp.reference) {
                continue;
            }
            let Some(times) = self.sourcelog.get(hash) else {
                continue;
            };
            let (Some(&src_ts), Some(&ref_ts)) =
                (times.get(&comp.source), times.get(&comp.reference))
            else {
                continue;
            };

            shared_included += 1;
            let delta = ref_ts - src_ts;
            // Simultaneous arrivals carry no ordering signal.
            if delta > 0 {
                let _ = source_first.record(delta as u64);
            } else if delta < 0 {
                let _ = reference_first.record((-delta) as u64);
            }
        }

        Ok(LatencyComparison {
            source: comp.source.clone(),
            reference: comp.reference.clone(),
            source_first,
            reference_first,
            shared_included,
        })
    }

    /// Run every configured comparison and render the full report.
    pub fn report(&self) -> Result<String> {
        let comps: Vec<LatencyComparison> = self
            .comps
            .iter()
            .map(|c| self.latency_comp(c))
            .collect::<Result<_>>()?;
        Ok(self.format_report(&comps))
    }

    fn format_report(&self, comps: &[LatencyComparison]) -> String {
        let mut out = String::new();
        out.push_str("Mempool Archive Summary\n");
        out.push_str("=======================\n\n");

        if let (Some(first), Some(last)) = (
            DateTime::from_timestamp(self.ts_first / 1000, 0),
            DateTime::from_timestamp(self.ts_last / 1000, 0),
        ) {
            let day_first = first.format("%Y-%m-%d").to_string();
            let day_last = last.format("%Y-%m-%d").to_string();
            if day_first == day_last {
                out.push_str(&format!("Date: {day_first}\n\n"));
            } else {
                out.push_str(&format!("Date: {day_first} - {day_last}\n\n"));
            }
            out.push_str(&format!(
                "- From: {} UTC\n- To:   {} UTC\n\n",
                first.format("%Y-%m-%d %H:%M:%S"),
                last.format("%Y-%m-%d %H:%M:%S")
            ));
        }

        out.push_str(&format!(
            "Unique transactions: {}\n",
            fmt_count(self.n_unique)
        ));
        out.push_str(&format!(
            "- Included on-chain: {} ({})\n",
            fmt_count(self.n_included),
            fmt_pct(self.n_included, self.n_unique)
        ));
        out.push_str(&format!(
            "- Not included:      {} ({})\n\n",
            fmt_count(self.n_not_included),
            fmt_pct(self.n_not_included, self.n_unique)
        ));

        out.push_str(&format!("Sources: {}\n\n", self.sources().join(", ")));

        out.push_str("Transaction Stats\n-----------------\n");
        out.push_str(&format!(
            "{:<14} {:>14} {:>22} {:>22}\n",
            "source", "transactions", "included on-chain", "not included"
        ));
        for (src, &n_tx) in &self.tx_per_source {
            let on_chain = self.on_chain_by_source.get(src).copied().unwrap_or(0);
            let off_chain = self.not_on_chain_by_source.get(src).copied().unwrap_or(0);
            out.push_str(&format!(
                "{:<14} {:>14} {:>22} {:>22}\n",
                src,
                fmt_count(n_tx),
                format!("{} ({})", fmt_count(on_chain), fmt_pct(on_chain, n_tx)),
                format!("{} ({})", fmt_count(off_chain), fmt_pct(off_chain, n_tx)),
            ));
        }

        out.push_str("\nExclusive Transactions\n----------------------\n");
        out.push_str(&format!(
            "{} of {} exclusive transactions were included on-chain ({}).\n\n",
            fmt_count(self.n_exclusive_included),
            fmt_count(self.n_exclusive),
            fmt_pct(self.n_exclusive_included, self.n_exclusive)
        ));
        out.push_str(&format!(
            "{:<14} {:>14} {:>22} {:>22}\n",
            "source", "transactions", "included on-chain", "not included"
        ));
        for src in self.sources() {
            let included = self.exclusive_included.get(&src).copied().unwrap_or(0);
            let not_included = self.exclusive_not_included.get(&src).copied().unwrap_or(0);
            let exclusive = included + not_included;
            if exclusive == 0 {
                continue;
            }
            out.push_str(&format!(
                "{:<14} {:>14} {:>22} {:>22}\n",
                src,
                fmt_count(exclusive),
                format!("{} ({})", fmt_count(included), fmt_pct(included, exclusive)),
                format!(
                    "{} ({})",
                    fmt_count(not_included),
                    fmt_pct(not_included, exclusive)
                ),
            ));
        }

        if !comps.is_empty() {
            out.push_str("\nLatency Comparison\n------------------\n");
        }
        for comp in comps {
            out.push_str(&format!(
                "\n### {} vs {}\n{} shared included transactions.\n\n",
                comp.source,
                comp.reference,
                fmt_count(comp.shared_included as i64)
            ));
            let src_label = format!("{} first", comp.source);
            let ref_label = format!("{} first", comp.reference);
            out.push_str(&format!("{:<10} {:>20} {:>20}\n", "", src_label, ref_label));

            let shared = comp.shared_included as i64;
            let (s, r) = (&comp.source_first, &comp.reference_first);
            out.push_str(&format!(
                "{:<10} {:>20} {:>20}\n",
                "count",
                fmt_count(s.len() as i64),
                fmt_count(r.len() as i64)
            ));
            out.push_str(&format!(
                "{:<10} {:>20} {:>20}\n",
                "percent",
                fmt_pct(s.len() as i64, shared),
                fmt_pct(r.len() as i64, shared)
            ));
            for (label, q) in [("median", 0.50), ("p90", 0.90), ("p95", 0.95), ("p99", 0.99)] {
                out.push_str(&format!(
                    "{:<10} {:>20} {:>20}\n",
                    label,
                    format!("{} ms", fmt_count(s.value_at_quantile(q) as i64)),
                    format!("{} ms", fmt_count(r.value_at_quantile(q) as i64)),
                ));
            }
        }

        out
    }
}

fn new_latency_histogram() -> Result<Histogram<u64>> {
    Histogram::new_with_bounds(1, LATENCY_HIST_MAX_MS, LATENCY_HIST_SIGFIGS)
        .map_err(|e| anyhow!("failed to create latency histogram: {e:?}"))
}

/// Render an integer with thousands separators.
fn fmt_count(n: i64) -> String {
    let digits = n.abs().to_string();
    let mut grouped = String::new();
    for (i, c) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            grouped.push(',');
        }
        grouped.push(c);
    }
    if n < 0 {
        format!("-{grouped}")
    } else {
        grouped
    }
}

fn fmt_pct(part: i64, total: i64) -> String {
    if total == 0 {
        return "-".to_string();
    }
    format!("{:.1}%", part as f64 * 100.0 / total as f64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn entry(ts: i64, sources: &[&str], included_height: i64) -> TxSummaryEntry {
        TxSummaryEntry {
            timestamp_ms: ts,
            sources: sources.iter().map(|s| s.to_string()).collect(),
            included_at_block_height: included_height,
            ..Default::default()
        }
    }

    fn sourcelog_for(entries: &[(&str, &str, i64)]) -> Sourcelog {
        let mut sl = Sourcelog::new();
        for (hash, source, ts) in entries {
            sl.entry(hash.to_string())
                .or_default()
                .insert(source.to_string(), *ts);
        }
        sl
    }

    #[test]
    fn test_per_source_and_inclusion_counts() {
        let mut txs = HashMap::new();
        txs.insert("0xh1".to_string(), entry(1000, &["a", "b"], 100));
        txs.insert("0xh2".to_string(), entry(2000, &["a"], 0));
        txs.insert("0xh3".to_string(), entry(3000, &["b"], 101));

        let sl = Sourcelog::new();
        let a = Analyzer::new(&txs, &sl, vec![]);

        assert_eq!(a.n_unique, 3);
        assert_eq!(a.n_included, 2);
        assert_eq!(a.n_not_included, 1);
        assert_eq!(a.tx_per_source["a"], 2);
        assert_eq!(a.tx_per_source["b"], 2);
        assert_eq!(a.on_chain_by_source["b"], 2);
        assert_eq!(a.not_on_chain_by_source["a"], 1);
        assert_eq!(a.sources(), vec!["a".to_string(), "b".to_string()]);
        assert_eq!(a.ts_first, 1000);
        assert_eq!(a.ts_last, 3000);
    }

    #[test]
    fn test_timestamp_range_includes_epoch_zero() {
        let mut txs = HashMap::new();
        txs.insert("0xh1".to_string(), entry(0, &["a"], 0));
        txs.insert("0xh2".to_string(), entry(5000, &["a"], 0));
        txs.insert("0xh3".to_string(), entry(3000, &["a"], 0));

        let sl = Sourcelog::new();
        let a = Analyzer::new(&txs, &sl, vec![]);

        assert_eq!(a.ts_first, 0);
        assert_eq!(a.ts_last, 5000);
    }

    #[test]
    fn test_exclusive_orderflow_split() {
        let mut txs = HashMap::new();
        txs.insert("0xh1".to_string(), entry(1, &["a"], 5));
        txs.insert("0xh2".to_string(), entry(2, &["a"], 0));
        txs.insert("0xh3".to_string(), entry(3, &["a", "b"], 7));

        let sl = Sourcelog::new();
        let a = Analyzer::new(&txs, &sl, vec![]);

        assert_eq!(a.n_exclusive, 2);
        assert_eq!(a.n_exclusive_included, 1);
        assert_eq!(a.n_exclusive_not_included, 1);
        assert_eq!(a.exclusive_included["a"], 1);
        assert_eq!(a.exclusive_not_included["a"], 1);
    }

    #[test]
    fn test_latency_pair_records_positive_delta_for_source_first() {
        let mut txs = HashMap::new();
        txs.insert("0xh1".to_string(), entry(1000, &["a", "b"], 42));
        let sl = sourcelog_for(&[("0xh1", "a", 1000), ("0xh1", "b", 1200)]);

        let a = Analyzer::new(&txs, &sl, vec![]);
        let comp = a.latency_comp(&SourceComp::new("a", "b")).unwrap();

        assert_eq!(comp.shared_included, 1);
        assert_eq!(comp.source_first.len(), 1);
        assert_eq!(comp.reference_first.len(), 0);
        assert_eq!(comp.source_first.value_at_quantile(0.50), 200);
    }

    #[test]
    fn test_latency_pair_ignores_ties_and_not_included() {
        let mut txs = HashMap::new();
        // tie: ignored entirely
        txs.insert("0xh1".to_string(), entry(1000, &["a", "b"], 1));
        // not included: excluded from the population
        txs.insert("0xh2".to_string(), entry(1000, &["a", "b"], 0));
        let sl = sourcelog_for(&[
            ("0xh1", "a", 500),
            ("0xh1", "b", 500),
            ("0xh2", "a", 100),
            ("0xh2", "b", 900),
        ]);

        let a = Analyzer::new(&txs, &sl, vec![]);
        let comp = a.latency_comp(&SourceComp::new("a", "b")).unwrap();

        assert_eq!(comp.shared_included, 1);
        assert_eq!(comp.source_first.len(), 0);
        assert_eq!(comp.reference_first.len(), 0);
    }

    #[test]
    fn test_report_renders() {
        let mut txs = HashMap::new();
        txs.insert("0xh1".to_string(), entry(1_693_526_400_000, &["a", "b"], 1));
        let sl = sourcelog_for(&[("0xh1", "a", 1_693_526_400_000), ("0xh1", "b", 1_693_526_400_100)]);

        let a = Analyzer::new(&txs, &sl, vec![SourceComp::new("a", "b")]);
        let report = a.report().unwrap();

        assert!(report.contains("Unique transactions: 1"));
        assert!(report.contains("Sources: a, b"));
        assert!(report.contains("### a vs b"));
        assert!(report.contains("100 ms"));
    }

    #[test]
    fn test_fmt_count_groups_thousands() {
        assert_eq!(fmt_count(0), "0");
        assert_eq!(fmt_count(999), "999");
        assert_eq!(fmt_count(1_000), "1,000");
        assert_eq!(fmt_count(1_234_567), "1,234,567");
        assert_eq!(fmt_count(-1_234), "-1,234");
    }
}
