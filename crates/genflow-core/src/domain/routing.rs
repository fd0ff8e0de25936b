//! Routing decision: which queue and which model serve a task.
//!
//! Pure function of the template, its variables and the caller's quota. The
//! result is never persisted; admission and the worker recompute it.

use serde::{Deserialize, Serialize};

use super::stage::{Modality, Stage, Tier};
use super::task::ExecutionKind;
use crate::config::{RoutingConfig, TemplateRoute};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoutingDecision {
    pub queue_id: String,
    pub model_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RoutingError {
    #[error("unknown template: {0}")]
    UnknownTemplate(String),

    #[error("no model configured for stage {0}")]
    NoModel(Stage),
}

#[derive(Debug, Clone)]
pub struct RoutingTable {
    config: RoutingConfig,
}

impl RoutingTable {
    pub fn new(config: RoutingConfig) -> Self {
        Self { config }
    }

    pub fn route(&self, template_id: &str) -> Result<TemplateRoute, RoutingError> {
        self.config
            .templates
            .get(template_id)
            .copied()
            .ok_or_else(|| RoutingError::UnknownTemplate(template_id.to_string()))
    }

    pub fn stage(&self, template_id: &str) -> Result<Stage, RoutingError> {
        self.route(template_id).map(|r| r.stage)
    }

    pub fn kind(&self, template_id: &str) -> Result<ExecutionKind, RoutingError> {
        self.route(template_id).map(|r| r.kind)
    }

    /// Resolve `(queue_id, model_id)`.
    ///
    /// `variables.modality` overrides the stage's default modality when it
    /// names a known modality; anything else falls back to the default.
    pub fn decide(
        &self,
        template_id: &str,
        variables: &serde_json::Value,
        has_quota: bool,
    ) -> Result<RoutingDecision, RoutingError> {
        let stage = self.stage(template_id)?;
        let tier = Tier::from_quota(has_quota);
        let modality = variables
            .get("modality")
            .and_then(|v| v.as_str())
            .and_then(|m| m.parse::<Modality>().ok())
            .unwrap_or_else(|| stage.default_modality());
        let model_id = self
            .config
            .models
            .get(&stage)
            .map(|choice| choice.for_tier(tier).to_string())
            .ok_or(RoutingError::NoModel(stage))?;

        Ok(RoutingDecision {
            queue_id: queue_id(tier, modality),
            model_id,
        })
    }

    /// Every model id the table can route to.
    pub fn model_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .config
            .models
            .values()
            .flat_map(|c| [c.free.clone(), c.paid.clone()])
            .collect();
        ids.sort();
        ids.dedup();
        ids
    }
}

pub fn queue_id(tier: Tier, modality: Modality) -> String {
    format!("{}-{}", tier.as_str(), modality.as_str())
}

/// Inverse of [`queue_id`].
pub fn parse_queue_id(queue_id: &str) -> Option<(Tier, Modality)> {
    let (tier, modality) = queue_id.split_once('-')?;
    let tier = match tier {
        "free" => Tier::Free,
        "paid" => Tier::Paid,
        _ => return None,
    };
    Some((tier, modality.parse().ok()?))
}
