//! Declarative blocking rules for audio-only mode and the synchronizer that keeps the
//! host's active rule set equal to the one implied by the `audioOnlyMode` setting.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::config;
use crate::error::AppError;
use crate::host::RuleEngine;

/// Stable numeric identifier of an installed rule.
pub type RuleId = u32;

/// Resource kinds a rule condition can be restricted to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    MainFrame,
    SubFrame,
    Stylesheet,
    Script,
    Image,
    Font,
    Object,
    Xmlhttprequest,
    Ping,
    Media,
    Websocket,
    Other,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum RuleAction {
    Block,
}

/// Match half of a rule: a request URL regex plus the resource kinds it applies to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuleCondition {
    pub regex_filter: String,
    pub resource_types: Vec<ResourceKind>,
}

/// One declarative match-and-block instruction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RulePredicate {
    pub id: RuleId,
    pub priority: u32,
    pub action: RuleAction,
    pub condition: RuleCondition,
}

/// A single atomic update submitted to the host rule engine.
///
/// Removals are applied before additions, so re-adding an id in the same batch replaces it.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuleBatch {
    pub add_rules: Vec<RulePredicate>,
    pub remove_rule_ids: Vec<RuleId>,
}

/// The full predicate pair installed while audio-only mode is on.
pub fn audio_only_rules() -> Vec<RulePredicate> {
    vec![
        RulePredicate {
            id: config::VIDEO_RULE_ID,
            priority: config::BLOCK_RULE_PRIORITY,
            action: RuleAction::Block,
            condition: RuleCondition {
                regex_filter: config::VIDEO_URL_PATTERN.to_string(),
                resource_types: vec![ResourceKind::Media],
            },
        },
        RulePredicate {
            id: config::STORYBOARD_RULE_ID,
            priority: config::BLOCK_RULE_PRIORITY,
            action: RuleAction::Block,
            condition: RuleCondition {
                regex_filter: config::STORYBOARD_URL_PATTERN.to_string(),
                resource_types: vec![ResourceKind::Image],
            },
        },
    ]
}

/// Ids owned by the synchronizer. Nothing else installs rules under them.
pub const AUDIO_ONLY_RULE_IDS: [RuleId; 2] = [config::VIDEO_RULE_ID, config::STORYBOARD_RULE_ID];

/// Reconciles the host rule set with the desired audio-only state.
pub struct RuleSynchronizer {
    engine: Arc<dyn RuleEngine>,
}

impl RuleSynchronizer {
    pub fn new(engine: Arc<dyn RuleEngine>) -> Self {
        Self { engine }
    }

    /// The batch that moves any prior state to the one implied by `enabled`.
    pub fn desired_batch(enabled: bool) -> RuleBatch {
        RuleBatch {
            add_rules: if enabled { audio_only_rules() } else { Vec::new() },
            remove_rule_ids: AUDIO_ONLY_RULE_IDS.to_vec(),
        }
    }

    /// Submit the batch for `enabled` as one host call.
    pub async fn reconcile(&self, enabled: bool) -> Result<(), AppError> {
        let batch = Self::desired_batch(enabled);
        match self.engine.install_rules(&batch).await {
            Ok(()) => {
                tracing::info!(
                    "Audio-only rules {}",
                    if enabled { "installed" } else { "removed" }
                );
                Ok(())
            }
            Err(e) => {
                tracing::error!("Rule batch rejected (enabled={enabled}): {e}");
                Err(match e {
                    AppError::RuleInstallFailed(msg) => AppError::RuleInstallFailed(msg),
                    other => AppError::RuleInstallFailed(other.to_string()),
                })
            }
        }
    }
}
