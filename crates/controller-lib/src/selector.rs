//! Candidate selection: rank replacement pools by price and risk
//!
//! Poisoned pools are discarded outright; the survivors are scored by a
//! weighted combination of normalized price and the model gate's risk score.
//! A stable-lifecycle fallback is always appended, so the caller never
//! receives an empty list while any stable option exists.

use crate::error::{CoreError, Result};
use crate::gate::ModelGate;
use crate::models::{Candidate, Lifecycle, Pool, PricePoint};
use crate::risk::RiskLedger;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, warn};

/// Maximum price points retained per pool
const MAX_PRICE_POINTS: usize = 288;

/// An orderable capacity offer known to the price book
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolOffer {
    pub pool: Pool,
    pub lifecycle: Lifecycle,
    pub instance_family: String,
    pub architecture: String,
    pub capacity: u32,
}

/// Per-pool price history and the catalog of known offers
pub struct PriceBook {
    offers: DashMap<Pool, PoolOffer>,
    prices: DashMap<Pool, Vec<PricePoint>>,
}

impl Default for PriceBook {
    fn default() -> Self {
        Self::new()
    }
}

impl PriceBook {
    pub fn new() -> Self {
        Self {
            offers: DashMap::new(),
            prices: DashMap::new(),
        }
    }

    pub fn add_offer(&self, offer: PoolOffer) {
        self.offers.insert(offer.pool.clone(), offer);
    }

    pub fn record_price(&self, pool: &Pool, timestamp: i64, price: f64) {
        let mut history = self.prices.entry(pool.clone()).or_default();
        history.push(PricePoint { timestamp, price });
        if history.len() > MAX_PRICE_POINTS {
            let excess = history.len() - MAX_PRICE_POINTS;
            history.drain(0..excess);
        }
    }

    pub fn history(&self, pool: &Pool) -> Vec<PricePoint> {
        self.prices.get(pool).map(|h| h.clone()).unwrap_or_default()
    }

    /// Most recent observed price for a pool
    pub fn current_price(&self, pool: &Pool) -> Option<f64> {
        self.prices
            .get(pool)
            .and_then(|h| h.last().map(|p| p.price))
    }

    pub fn offers(&self) -> Vec<PoolOffer> {
        self.offers.iter().map(|e| e.value().clone()).collect()
    }
}

/// Filter constraints for replacement pools
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Constraints {
    pub instance_family: Option<String>,
    pub architecture: Option<String>,
    pub min_capacity: u32,
}

impl Constraints {
    fn matches(&self, offer: &PoolOffer) -> bool {
        if let Some(family) = &self.instance_family {
            if &offer.instance_family != family {
                return false;
            }
        }
        if let Some(arch) = &self.architecture {
            if &offer.architecture != arch {
                return false;
            }
        }
        offer.capacity >= self.min_capacity
    }
}

/// Scoring weights; lower combined score ranks first
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SelectorConfig {
    pub price_weight: f64,
    pub risk_weight: f64,
    pub max_candidates: usize,
}

impl Default for SelectorConfig {
    fn default() -> Self {
        Self {
            price_weight: 0.6,
            risk_weight: 0.4,
            max_candidates: 5,
        }
    }
}

/// Ranks acceptable replacement pools for a switch
pub struct CandidateSelector {
    ledger: Arc<RiskLedger>,
    gate: Arc<ModelGate>,
    book: Arc<PriceBook>,
    config: SelectorConfig,
}

impl CandidateSelector {
    pub fn new(
        ledger: Arc<RiskLedger>,
        gate: Arc<ModelGate>,
        book: Arc<PriceBook>,
        config: SelectorConfig,
    ) -> Self {
        Self {
            ledger,
            gate,
            book,
            config,
        }
    }

    /// Ordered replacement candidates for a resource currently in
    /// `current_pool`. Guaranteed non-empty whenever a stable offer exists;
    /// `NoCandidate` means capacity is exhausted everywhere.
    pub fn select_candidates(
        &self,
        current_pool: &Pool,
        constraints: &Constraints,
    ) -> Result<Vec<Candidate>> {
        let offers = self.book.offers();
        let eligible: Vec<&PoolOffer> = offers
            .iter()
            .filter(|o| constraints.matches(o) && &o.pool != current_pool)
            .collect();

        let max_price = eligible
            .iter()
            .filter_map(|o| self.book.current_price(&o.pool))
            .fold(0.0_f64, f64::max);

        let mut interruptible: Vec<Candidate> = Vec::new();
        for offer in eligible.iter().filter(|o| o.lifecycle == Lifecycle::Interruptible) {
            if self.ledger.is_poisoned(&offer.pool) {
                debug!(pool = %offer.pool, "Skipping poisoned pool");
                continue;
            }
            if let Some(candidate) = self.score_offer(offer, max_price) {
                interruptible.push(candidate);
            }
        }
        interruptible.sort_by(|a, b| {
            a.combined_score
                .partial_cmp(&b.combined_score)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        interruptible.truncate(self.config.max_candidates);

        // Guaranteed fallback: the cheapest stable offer is always appended,
        // even when every interruptible pool survived filtering.
        let fallback = eligible
            .iter()
            .filter(|o| o.lifecycle == Lifecycle::Stable)
            .filter_map(|o| self.score_offer(o, max_price))
            .min_by(|a, b| {
                a.price
                    .partial_cmp(&b.price)
                    .unwrap_or(std::cmp::Ordering::Equal)
            });

        let mut candidates = interruptible;
        match fallback {
            Some(stable) => {
                if !candidates.iter().any(|c| c.pool == stable.pool) {
                    candidates.push(stable);
                }
            }
            None => {
                if candidates.is_empty() {
                    warn!(pool = %current_pool, "No replacement capacity anywhere");
                    return Err(CoreError::NoCandidate(format!(
                        "no eligible pool for {current_pool}, stable fallback included"
                    )));
                }
            }
        }

        Ok(candidates)
    }

    fn score_offer(&self, offer: &PoolOffer, max_price: f64) -> Option<Candidate> {
        let price = self.book.current_price(&offer.pool)?;
        let normalized_price = if max_price > 0.0 { price / max_price } else { 0.0 };
        let history = self.book.history(&offer.pool);
        let risk = match offer.lifecycle {
            Lifecycle::Interruptible => self.gate.score(&offer.pool, &history),
            // Stable capacity is never reclaimed
            Lifecycle::Stable => 0.0,
        };
        let combined = self.config.price_weight * normalized_price
            + self.config.risk_weight * f64::from(risk);
        Some(Candidate {
            pool: offer.pool.clone(),
            lifecycle: offer.lifecycle,
            price,
            risk_score: risk,
            combined_score: combined,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn offer(zone: &str, resource_type: &str, lifecycle: Lifecycle) -> PoolOffer {
        PoolOffer {
            pool: Pool::new("us-east-1", zone, resource_type),
            lifecycle,
            instance_family: "m5".into(),
            architecture: "x86_64".into(),
            capacity: 10,
        }
    }

    fn setup() -> (Arc<RiskLedger>, Arc<PriceBook>, CandidateSelector) {
        let ledger = Arc::new(RiskLedger::new());
        let gate = Arc::new(ModelGate::new());
        let book = Arc::new(PriceBook::new());
        let selector = CandidateSelector::new(
            ledger.clone(),
            gate,
            book.clone(),
            SelectorConfig::default(),
        );
        (ledger, book, selector)
    }

    fn seed(book: &PriceBook, o: PoolOffer, price: f64) {
        book.record_price(&o.pool, 0, price);
        book.add_offer(o);
    }

    #[test]
    fn test_cheaper_interruptible_ranks_first() {
        let (_, book, selector) = setup();
        seed(&book, offer("us-east-1a", "m5.large", Lifecycle::Interruptible), 0.03);
        seed(&book, offer("us-east-1b", "m5.large", Lifecycle::Interruptible), 0.09);
        seed(&book, offer("us-east-1c", "m5.large.stable", Lifecycle::Stable), 0.10);

        let current = Pool::new("us-east-1", "us-east-1d", "m5.large");
        let candidates = selector
            .select_candidates(&current, &Constraints::default())
            .unwrap();

        assert_eq!(candidates[0].pool.zone, "us-east-1a");
        // Stable fallback is present at the end
        assert!(candidates.iter().any(|c| c.lifecycle == Lifecycle::Stable));
    }

    #[test]
    fn test_poisoned_pools_discarded() {
        let (ledger, book, selector) = setup();
        let poisoned = offer("us-east-1a", "m5.large", Lifecycle::Interruptible);
        ledger.mark_poisoned(&poisoned.pool, "tenant-x");
        seed(&book, poisoned, 0.02);
        seed(&book, offer("us-east-1b", "m5.large", Lifecycle::Interruptible), 0.05);
        seed(&book, offer("us-east-1c", "m5.large.stable", Lifecycle::Stable), 0.10);

        let current = Pool::new("us-east-1", "us-east-1d", "m5.large");
        let candidates = selector
            .select_candidates(&current, &Constraints::default())
            .unwrap();

        assert!(candidates.iter().all(|c| c.pool.zone != "us-east-1a"));
    }

    #[test]
    fn test_stable_fallback_when_everything_poisoned() {
        let (ledger, book, selector) = setup();
        for zone in ["us-east-1a", "us-east-1b"] {
            let o = offer(zone, "m5.large", Lifecycle::Interruptible);
            ledger.mark_poisoned(&o.pool, "tenant-x");
            seed(&book, o, 0.03);
        }
        seed(&book, offer("us-east-1c", "m5.large.stable", Lifecycle::Stable), 0.10);

        let current = Pool::new("us-east-1", "us-east-1d", "m5.large");
        let candidates = selector
            .select_candidates(&current, &Constraints::default())
            .unwrap();

        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].lifecycle, Lifecycle::Stable);
        assert_eq!(candidates[0].risk_score, 0.0);
    }

    #[test]
    fn test_no_candidate_when_capacity_exhausted() {
        let (_, _, selector) = setup();
        let current = Pool::new("us-east-1", "us-east-1d", "m5.large");
        let err = selector
            .select_candidates(&current, &Constraints::default())
            .unwrap_err();
        assert_eq!(err.kind(), "no_candidate");
    }

    #[test]
    fn test_constraints_filter_family() {
        let (_, book, selector) = setup();
        let mut other = offer("us-east-1a", "c5.large", Lifecycle::Interruptible);
        other.instance_family = "c5".into();
        seed(&book, other, 0.02);
        seed(&book, offer("us-east-1b", "m5.large", Lifecycle::Interruptible), 0.05);
        seed(&book, offer("us-east-1c", "m5.large.stable", Lifecycle::Stable), 0.10);

        let constraints = Constraints {
            instance_family: Some("m5".into()),
            ..Default::default()
        };
        let current = Pool::new("us-east-1", "us-east-1d", "m5.large");
        let candidates = selector.select_candidates(&current, &constraints).unwrap();
        assert!(candidates.iter().all(|c| c.pool.resource_type != "c5.large"));
    }

    #[test]
    fn test_price_history_is_bounded() {
        let book = PriceBook::new();
        let pool = Pool::new("us-east-1", "us-east-1a", "m5.large");
        for i in 0..(MAX_PRICE_POINTS + 50) {
            book.record_price(&pool, i as i64, 0.03);
        }
        assert_eq!(book.history(&pool).len(), MAX_PRICE_POINTS);
    }
}
