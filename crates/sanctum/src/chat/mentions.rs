//! `@username` mentions in chat messages.

use std::collections::{HashMap, HashSet};

use once_cell::sync::Lazy;
use regex::Regex;
use sanctum_protocol::UserId;

static MENTION: Lazy<Regex> = Lazy::new(|| {
    #[allow(clippy::unwrap_used)]
    Regex::new(r"@([A-Za-z0-9_]{2,32})").unwrap()
});

/// A conversation member as seen by mention resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Participant {
    pub user_id: UserId,
    pub username: String,
}

/// Mentioned usernames, lower-cased, in order of first appearance.
pub fn extract_mentions(content: &str) -> Vec<String> {
    let mut seen = HashSet::new();
    MENTION
        .captures_iter(content)
        .filter_map(|caps| caps.get(1))
        .map(|m| m.as_str().to_lowercase())
        .filter(|name| seen.insert(name.clone()))
        .collect()
}

/// Participants mentioned in `content`, never including the sender.
pub fn resolve_mentions(content: &str, sender_id: UserId, participants: &[Participant]) -> Vec<UserId> {
    let by_name: HashMap<String, UserId> = participants
        .iter()
        .map(|p| (p.username.to_lowercase(), p.user_id))
        .collect();

    let mut seen = HashSet::new();
    extract_mentions(content)
        .iter()
        .filter_map(|name| by_name.get(name).copied())
        .filter(|&user_id| user_id != sender_id && seen.insert(user_id))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_lowercased_unique_names() {
        assert_eq!(
            extract_mentions("hey @Alice and @bob_2, @alice again; mail@x"),
            vec!["alice", "bob_2"]
        );
        assert!(extract_mentions("@a is too short").is_empty());
    }

    #[test]
    fn long_names_are_truncated_to_limit() {
        let name = "a".repeat(40);
        let found = extract_mentions(&format!("@{name}"));
        assert_eq!(found, vec!["a".repeat(32)]);
    }

    #[test]
    fn resolution_skips_sender_and_strangers() {
        let participants = vec![
            Participant {
                user_id: 1,
                username: "Alice".into(),
            },
            Participant {
                user_id: 2,
                username: "bob".into(),
            },
        ];
        assert_eq!(
            resolve_mentions("@alice @BOB @carol", 1, &participants),
            vec![2]
        );
    }
}
