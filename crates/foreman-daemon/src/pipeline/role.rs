//! Pipeline roles: order, prompts and the agents that serve them.

use foreman_core::config::RoleRoster;

use crate::storage::{Feature, Role};

const ARCHITECT_PROMPT: &str = "You are the architect. Read the feature below and write an \
implementation plan: files to touch, key types and functions, and the order of work. Do not \
write code.";

const CODER_PROMPT: &str = "You are the coder. Implement the feature below following the \
architect's plan. Keep changes focused and make sure the project builds.";

const REVIEWER_PROMPT: &str = "You are the reviewer. Review the implementation of the feature \
below for correctness, missing edge cases and style. Fix what you find or report why it cannot \
be accepted.";

const TESTER_PROMPT: &str = "You are the tester. Verify the feature below: add or update tests, \
run them, and report failure if any requirement is not met.";

impl Role {
    /// All roles in pipeline order.
    pub const ALL: [Self; 4] = [Self::Architect, Self::Coder, Self::Reviewer, Self::Tester];

    pub const fn first() -> Self {
        Self::Architect
    }

    /// The role after this one, `None` after the tester.
    pub const fn next(self) -> Option<Self> {
        match self {
            Self::Architect => Some(Self::Coder),
            Self::Coder => Some(Self::Reviewer),
            Self::Reviewer => Some(Self::Tester),
            Self::Tester => None,
        }
    }

    pub const fn prompt_template(self) -> &'static str {
        match self {
            Self::Architect => ARCHITECT_PROMPT,
            Self::Coder => CODER_PROMPT,
            Self::Reviewer => REVIEWER_PROMPT,
            Self::Tester => TESTER_PROMPT,
        }
    }

    /// Agent identity serving this role.
    pub fn agent(self, roster: &RoleRoster) -> &str {
        match self {
            Self::Architect => &roster.architect,
            Self::Coder => &roster.coder,
            Self::Reviewer => &roster.reviewer,
            Self::Tester => &roster.tester,
        }
    }

    /// First turn for this role's session.
    pub fn render_prompt(self, feature: &Feature, previous: Option<&str>) -> String {
        let mut prompt = format!(
            "{}\n\n## Feature {}\n\n### {}\n\n{}\n",
            self.prompt_template(),
            feature.id,
            feature.title,
            feature.description
        );
        if let Some(previous) = previous.filter(|p| !p.trim().is_empty()) {
            prompt.push_str("\n## Previous step report\n\n");
            prompt.push_str(previous);
            prompt.push('\n');
        }
        prompt
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::FeatureStatus;

    fn feature() -> Feature {
        Feature {
            id: "f1".into(),
            project_id: "p1".into(),
            title: "Add login".into(),
            description: "Users sign in with email.".into(),
            priority: 0,
            status: FeatureStatus::InProgress,
            dependencies: Vec::new(),
            created_at: 0,
            updated_at: 0,
        }
    }

    #[test]
    fn roles_chain_in_order() {
        let mut chain = vec![Role::first()];
        while let Some(next) = chain.last().and_then(|r| r.next()) {
            chain.push(next);
        }
        assert_eq!(chain, Role::ALL);
    }

    #[test]
    fn roster_maps_roles_to_agents() {
        let roster = RoleRoster {
            coder: "nori".into(),
            ..RoleRoster::default()
        };
        assert_eq!(Role::Coder.agent(&roster), "nori");
        assert_eq!(Role::Tester.agent(&roster), "tester");
    }

    #[test]
    fn prompt_includes_feature_and_previous_report() {
        let prompt = Role::Coder.render_prompt(&feature(), Some("Plan: edit auth.rs"));
        assert!(prompt.starts_with(CODER_PROMPT));
        assert!(prompt.contains("Add login"));
        assert!(prompt.contains("Plan: edit auth.rs"));
        assert!(!Role::Architect.render_prompt(&feature(), None).contains("Previous step"));
    }
}
