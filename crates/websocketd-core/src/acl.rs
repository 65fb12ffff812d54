//! ACL matching for event authorization.
//!
//! ACL entries are dot-separated access strings such as
//! `events.users.me.chat_message_created`. Within an entry:
//! - `*` matches any run of characters inside one segment
//! - `#` as a whole segment matches zero or more segments
//! - `me` is replaced with the token owner's UUID
//! - `my_session` is replaced with the token's auth session UUID
//!
//! Entries starting with `!` are negative and override positive matches.

use crate::token::Token;

const SEPARATOR: char = '.';
const MULTI_SEGMENT: &str = "#";
const NEGATION: char = '!';

/// Compiled ACL of one token.
#[derive(Debug, Clone, Default)]
pub struct AccessCheck {
    positive: Vec<Vec<String>>,
    negative: Vec<Vec<String>>,
}

impl AccessCheck {
    /// Compiles `acl`, substituting `me` and `my_session` when known.
    pub fn new(user_uuid: Option<&str>, session_uuid: Option<&str>, acl: &[String]) -> Self {
        let mut check = Self::default();

        for entry in acl {
            let (negated, body) = match entry.strip_prefix(NEGATION) {
                Some(body) => (true, body),
                None => (false, entry.as_str()),
            };

            let segments = body
                .split(SEPARATOR)
                .map(|segment| match (segment, user_uuid, session_uuid) {
                    ("me", Some(user), _) => user.to_string(),
                    ("my_session", _, Some(session)) => session.to_string(),
                    (other, _, _) => other.to_string(),
                })
                .collect();

            if negated {
                check.negative.push(segments);
            } else {
                check.positive.push(segments);
            }
        }

        check
    }

    /// Compiles the ACL carried by `token`.
    pub fn for_token(token: &Token) -> Self {
        Self::new(token.user_uuid(), token.session_uuid.as_deref(), &token.acl)
    }

    /// Returns true if `required` is granted and not explicitly denied.
    pub fn matches_required_access(&self, required: &str) -> bool {
        let target: Vec<&str> = required.split(SEPARATOR).collect();

        if self
            .negative
            .iter()
            .any(|pattern| match_segments(pattern, &target))
        {
            return false;
        }

        self.positive
            .iter()
            .any(|pattern| match_segments(pattern, &target))
    }

    /// Returns true if the ACL has no positive entry.
    pub fn is_empty(&self) -> bool {
        self.positive.is_empty()
    }
}

fn match_segments(pattern: &[String], target: &[&str]) -> bool {
    match pattern.split_first() {
        None => target.is_empty(),
        Some((head, rest)) if head == MULTI_SEGMENT => {
            (0..=target.len()).any(|skip| target.get(skip..).is_some_and(|tail| match_segments(rest, tail)))
        }
        Some((head, rest)) => match target.split_first() {
            Some((segment, tail)) => match_glob(head, segment) && match_segments(rest, tail),
            None => false,
        },
    }
}

/// Matches one segment where `*` stands for any run of characters.
fn match_glob(pattern: &str, value: &str) -> bool {
    let mut parts = pattern.split('*');
    let Some(first) = parts.next() else {
        return value.is_empty();
    };
    let Some(mut remaining) = value.strip_prefix(first) else {
        return false;
    };

    let parts: Vec<&str> = parts.collect();
    let Some((last, middle)) = parts.split_last() else {
        // No wildcard at all
        return remaining.is_empty();
    };

    for part in middle {
        match remaining.find(part) {
            Some(pos) => remaining = remaining.get(pos + part.len()..).unwrap_or_default(),
            None => return false,
        }
    }

    remaining.ends_with(last)
}
