//! Provider-neutral pull request events.
//!
//! Webhook ingress translates each provider's payload into a
//! `PullRequestEvent`; everything downstream only sees this shape.

use serde::{Deserialize, Serialize};

use crate::model::{CommitSha, Provider};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PullRequestAction {
    Opened,
    Synchronize,
    Reopened,
    Closed,
    Edited,
    /// Any other action string the provider sent.
    #[serde(untagged)]
    Other(String),
}

impl PullRequestAction {
    pub fn parse(action: &str) -> Self {
        match action {
            "opened" | "created" => Self::Opened,
            "synchronize" | "updated" => Self::Synchronize,
            "reopened" => Self::Reopened,
            "closed" | "merged" | "declined" => Self::Closed,
            "edited" => Self::Edited,
            other => Self::Other(other.to_string()),
        }
    }
}

/// Repository identity as the provider reports it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventRepository {
    pub external_id: String,
    pub owner: String,
    pub name: String,
    pub clone_url: String,
}

impl EventRepository {
    pub fn full_name(&self) -> String {
        format!("{}/{}", self.owner, self.name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PullRequestEvent {
    pub provider: Provider,
    pub action: PullRequestAction,
    /// Only meaningful for `Closed`.
    #[serde(default)]
    pub merged: bool,
    pub repository: EventRepository,
    /// GitHub App installation that delivered the event.
    #[serde(default)]
    pub installation_id: Option<u64>,
    pub pr_number: u64,
    pub base_sha: CommitSha,
    pub head_sha: CommitSha,
    /// Request correlation id, propagated to outgoing HTTP calls.
    #[serde(default)]
    pub correlation_id: Option<String>,
}

impl PullRequestEvent {
    pub fn is_merge(&self) -> bool {
        self.action == PullRequestAction::Closed && self.merged
    }

    /// Both base and head are hex object names.
    pub fn has_well_formed_shas(&self) -> bool {
        self.base_sha.is_well_formed() && self.head_sha.is_well_formed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_actions() {
        assert_eq!(PullRequestAction::parse("opened"), PullRequestAction::Opened);
        assert_eq!(
            PullRequestAction::parse("synchronize"),
            PullRequestAction::Synchronize
        );
        assert_eq!(PullRequestAction::parse("closed"), PullRequestAction::Closed);
        assert_eq!(
            PullRequestAction::parse("labeled"),
            PullRequestAction::Other("labeled".to_string())
        );
    }

    #[test]
    fn test_event_deserializes_with_defaults() {
        let json = r#"{
            "provider": "github",
            "action": "opened",
            "repository": {
                "external_id": "99",
                "owner": "acme",
                "name": "widgets",
                "clone_url": "https://github.com/acme/widgets.git"
            },
            "pr_number": 42,
            "base_sha": "def456",
            "head_sha": "abc123"
        }"#;
        let event: PullRequestEvent = serde_json::from_str(json).unwrap();
        assert_eq!(event.provider, Provider::GitHub);
        assert_eq!(event.action, PullRequestAction::Opened);
        assert!(!event.merged);
        assert_eq!(event.installation_id, None);
        assert_eq!(event.repository.full_name(), "acme/widgets");
        assert!(event.has_well_formed_shas());

        let mut traversal = event.clone();
        traversal.head_sha = CommitSha::from("../../../tmp");
        assert!(!traversal.has_well_formed_shas());
    }

    #[test]
    fn test_unknown_action_deserializes_as_other() {
        let action: PullRequestAction = serde_json::from_str(r#""labeled""#).unwrap();
        assert_eq!(action, PullRequestAction::Other("labeled".to_string()));
    }
}
