//! Model gate: the single-active-production-model invariant
//!
//! At most one scoring model influences live decisions at any instant.
//! Activation validates the target is graduated and flips the previous
//! active model off inside one registry critical section, so a crash can
//! never leave zero or two active models observable. Worker loops converge
//! on a new active model through a watch channel instead of a process
//! restart.

use crate::error::{CoreError, Result};
use crate::models::{PricePoint, Pool};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Lifecycle status of an ML model
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelStatus {
    /// Still in evaluation; may not be activated
    Candidate,
    /// Passed evaluation; eligible for production
    Graduated,
    /// Retired; kept for audit
    Archived,
}

/// A registered scoring model
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MlModel {
    pub model_id: String,
    pub version: String,
    pub status: ModelStatus,
    pub is_active_production: bool,
    pub trained_at: i64,
    pub validation_accuracy: Option<f32>,
}

/// Scoring capability: interruption risk for a pool given its price history
pub trait Scorer: Send + Sync {
    /// Risk probability in [0, 1]; higher means more likely to be interrupted
    fn score(&self, pool: &Pool, price_history: &[PricePoint]) -> f32;
}

struct ModelEntry {
    model: MlModel,
    scorer: Option<Arc<dyn Scorer>>,
}

/// Registry enforcing the single-active-model invariant
pub struct ModelGate {
    registry: RwLock<HashMap<String, ModelEntry>>,
    active_tx: watch::Sender<Option<String>>,
}

impl Default for ModelGate {
    fn default() -> Self {
        Self::new()
    }
}

impl ModelGate {
    pub fn new() -> Self {
        let (active_tx, _) = watch::channel(None);
        Self {
            registry: RwLock::new(HashMap::new()),
            active_tx,
        }
    }

    /// Register a model in `Candidate` status
    pub fn register(
        &self,
        model_id: impl Into<String>,
        version: impl Into<String>,
        scorer: Option<Arc<dyn Scorer>>,
    ) -> MlModel {
        let model = MlModel {
            model_id: model_id.into(),
            version: version.into(),
            status: ModelStatus::Candidate,
            is_active_production: false,
            trained_at: Utc::now().timestamp(),
            validation_accuracy: None,
        };
        let mut registry = self.registry.write().expect("model registry poisoned");
        registry.insert(
            model.model_id.clone(),
            ModelEntry {
                model: model.clone(),
                scorer,
            },
        );
        model
    }

    /// Promote a candidate model to graduated
    pub fn graduate(&self, model_id: &str, validation_accuracy: f32) -> Result<MlModel> {
        let mut registry = self.registry.write().expect("model registry poisoned");
        let entry = registry
            .get_mut(model_id)
            .ok_or_else(|| CoreError::NotFound(format!("model {model_id}")))?;
        if entry.model.status != ModelStatus::Candidate {
            return Err(CoreError::InvalidState(format!(
                "model {model_id} is {:?}, only candidates graduate",
                entry.model.status
            )));
        }
        entry.model.status = ModelStatus::Graduated;
        entry.model.validation_accuracy = Some(validation_accuracy);
        Ok(entry.model.clone())
    }

    /// Activate a graduated model, deactivating the previous active model in
    /// the same critical section.
    pub fn set_active_production(&self, model_id: &str) -> Result<MlModel> {
        let mut registry = self.registry.write().expect("model registry poisoned");

        // Validate the target before touching the current active flag; a
        // refused activation must leave the previous model untouched.
        let status = registry
            .get(model_id)
            .map(|e| e.model.status)
            .ok_or_else(|| CoreError::NotFound(format!("model {model_id}")))?;
        if status != ModelStatus::Graduated {
            return Err(CoreError::InvalidState(format!(
                "model {model_id} is {status:?}, only graduated models may be activated"
            )));
        }

        let previous = registry
            .values_mut()
            .find(|e| e.model.is_active_production)
            .map(|e| {
                e.model.is_active_production = false;
                e.model.model_id.clone()
            });

        let entry = registry
            .get_mut(model_id)
            .ok_or_else(|| CoreError::NotFound(format!("model {model_id}")))?;
        entry.model.is_active_production = true;
        let activated = entry.model.clone();

        info!(
            model_id = %activated.model_id,
            version = %activated.version,
            previous = previous.as_deref().unwrap_or("none"),
            "Activated production model"
        );

        // Workers subscribed to the gate converge without a restart
        let _ = self.active_tx.send(Some(activated.model_id.clone()));
        Ok(activated)
    }

    /// Archive a model; refused while it is the active production model
    pub fn archive(&self, model_id: &str) -> Result<MlModel> {
        let mut registry = self.registry.write().expect("model registry poisoned");
        let entry = registry
            .get_mut(model_id)
            .ok_or_else(|| CoreError::NotFound(format!("model {model_id}")))?;
        if entry.model.is_active_production {
            return Err(CoreError::InvalidState(format!(
                "model {model_id} is the active production model; deactivate it first"
            )));
        }
        entry.model.status = ModelStatus::Archived;
        Ok(entry.model.clone())
    }

    /// The current production model, if any.
    ///
    /// Observing two active models is an invariant violation: surfaced to
    /// operators, never silently auto-corrected here.
    pub fn current_production_model(&self) -> Result<Option<MlModel>> {
        let registry = self.registry.read().expect("model registry poisoned");
        let actives: Vec<&ModelEntry> = registry
            .values()
            .filter(|e| e.model.is_active_production)
            .collect();
        match actives.len() {
            0 => Ok(None),
            1 => Ok(Some(actives[0].model.clone())),
            n => Err(CoreError::InvariantViolation(format!(
                "{n} models marked active production"
            ))),
        }
    }

    /// Score a pool with the active model, falling back to a deterministic
    /// price-volatility heuristic when no model is active. Never errors: the
    /// candidate selector must always be able to proceed.
    pub fn score(&self, pool: &Pool, price_history: &[PricePoint]) -> f32 {
        let registry = self.registry.read().expect("model registry poisoned");
        if let Some(entry) = registry.values().find(|e| e.model.is_active_production) {
            if let Some(scorer) = &entry.scorer {
                let raw = scorer.score(pool, price_history);
                return raw.clamp(0.0, 1.0);
            }
            warn!(
                model_id = %entry.model.model_id,
                "Active model has no scorer attached, using heuristic"
            );
        } else {
            debug!(pool = %pool, "No active production model, using heuristic score");
        }
        heuristic_score(price_history)
    }

    /// Subscribe to active-model changes
    pub fn subscribe(&self) -> watch::Receiver<Option<String>> {
        self.active_tx.subscribe()
    }

    pub fn list(&self) -> Vec<MlModel> {
        let registry = self.registry.read().expect("model registry poisoned");
        let mut models: Vec<MlModel> = registry.values().map(|e| e.model.clone()).collect();
        models.sort_by(|a, b| a.model_id.cmp(&b.model_id));
        models
    }
}

/// Documented fallback: coefficient of variation of recent prices mapped
/// into [0, 1]. Volatile markets historically precede reclaims.
pub fn heuristic_score(price_history: &[PricePoint]) -> f32 {
    if price_history.len() < 2 {
        // Unknown market: middling risk rather than false confidence
        return 0.5;
    }
    let prices: Vec<f64> = price_history.iter().map(|p| p.price).collect();
    let mean = prices.iter().sum::<f64>() / prices.len() as f64;
    if mean <= f64::EPSILON {
        return 0.5;
    }
    let variance =
        prices.iter().map(|p| (p - mean).powi(2)).sum::<f64>() / prices.len() as f64;
    let cv = variance.sqrt() / mean;
    // A coefficient of variation of 0.5 or more saturates to maximum risk
    ((cv * 2.0).min(1.0)) as f32
}
