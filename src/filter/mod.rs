//! DNS query filtering module.
//!
//! Evaluates queried names against a block list loaded at startup. The
//! evaluation is a pure function of the name and the list.

mod blocklist;

pub use blocklist::Blocklist;

use serde::Serialize;

/// Outcome of evaluating a domain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Allow,
    Block,
}

/// Verdict for one evaluated domain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PolicyVerdict {
    pub action: Action,
    /// The block list entry that matched.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rule: Option<String>,
    pub domain: String,
}

impl PolicyVerdict {
    pub fn is_blocked(&self) -> bool {
        self.action == Action::Block
    }
}

/// How a blocked query is kept from reaching the upstream resolver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum BlockMode {
    /// Answer locally with a sinkhole response.
    #[default]
    Respond,
    /// Close the flow without answering.
    Drop,
}

/// Exact-match block policy.
#[derive(Debug, Default)]
pub struct BlockPolicy {
    blocklist: Blocklist,
}

impl BlockPolicy {
    pub fn new(blocklist: Blocklist) -> Self {
        Self { blocklist }
    }

    /// Evaluate a queried domain.
    pub fn evaluate(&self, domain: &str) -> PolicyVerdict {
        match self.blocklist.matches(domain) {
            Some(rule) => PolicyVerdict {
                action: Action::Block,
                rule: Some(rule.to_string()),
                domain: domain.to_string(),
            },
            None => PolicyVerdict {
                action: Action::Allow,
                rule: None,
                domain: domain.to_string(),
            },
        }
    }

    /// Returns the number of domains in the blocklist.
    pub fn blocked_count(&self) -> usize {
        self.blocklist.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn evaluate_is_case_insensitive() {
        let policy = BlockPolicy::new(Blocklist::from_domains(["example.com"]));

        let upper = policy.evaluate("Example.COM");
        let lower = policy.evaluate("example.com");

        assert_eq!(upper.action, lower.action);
        assert_eq!(upper.rule, lower.rule);
        assert!(upper.is_blocked());
        assert_eq!(upper.domain, "Example.COM");
    }

    #[test]
    fn evaluate_allows_unlisted_domain() {
        let policy = BlockPolicy::new(Blocklist::from_domains(["example.com"]));

        let verdict = policy.evaluate("example.org");

        assert_eq!(verdict.action, Action::Allow);
        assert_eq!(verdict.rule, None);
    }

    #[test]
    fn default_policy_allows_everything() {
        assert!(!BlockPolicy::default().evaluate("doubleclick.com").is_blocked());
    }
}
