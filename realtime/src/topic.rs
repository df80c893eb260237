//! Topic names that events are published to and connections subscribe to.
//!
//! The namespace is closed: `posts`, `responses`, `post:{id}`, `user:{id}`
//! and `circle:{id}`. Anything else fails to parse, which the authorizer
//! turns into a denial.

use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Topic {
    /// Global feed of new posts.
    Posts,
    /// Global feed of new responses.
    Responses,
    /// Activity on a single post.
    Post(String),
    /// Private channel of a single user.
    User(String),
    /// Membership-gated support circle.
    Circle(String),
}

/// A topic string outside the known namespace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownTopic(pub String);

impl Topic {
    /// The kind part of the topic, e.g. `circle` for `circle:42`.
    pub fn kind(&self) -> &'static str {
        match self {
            Topic::Posts => "posts",
            Topic::Responses => "responses",
            Topic::Post(_) => "post",
            Topic::User(_) => "user",
            Topic::Circle(_) => "circle",
        }
    }

    /// The scope id of scoped topics.
    pub fn scope_id(&self) -> Option<&str> {
        match self {
            Topic::Posts | Topic::Responses => None,
            Topic::Post(id) | Topic::User(id) | Topic::Circle(id) => Some(id),
        }
    }
}

fn valid_scope_id(id: &str) -> bool {
    !id.is_empty()
        && id.len() <= 64
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

impl FromStr for Topic {
    type Err = UnknownTopic;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let unknown = || UnknownTopic(s.to_string());

        match s.split_once(':') {
            None => match s {
                "posts" => Ok(Topic::Posts),
                "responses" => Ok(Topic::Responses),
                _ => Err(unknown()),
            },
            Some((kind, scope_id)) => {
                if !valid_scope_id(scope_id) {
                    return Err(unknown());
                }
                let scope_id = scope_id.to_string();
                match kind {
                    "post" => Ok(Topic::Post(scope_id)),
                    "user" => Ok(Topic::User(scope_id)),
                    "circle" => Ok(Topic::Circle(scope_id)),
                    _ => Err(unknown()),
                }
            }
        }
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self.scope_id() {
            Some(id) => write!(f, "{}:{}", self.kind(), id),
            None => write!(f, "{}", self.kind()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_every_known_kind() {
        assert_eq!("posts".parse(), Ok(Topic::Posts));
        assert_eq!("responses".parse(), Ok(Topic::Responses));
        assert_eq!("post:9".parse(), Ok(Topic::Post("9".into())));
        assert_eq!("user:u-1".parse(), Ok(Topic::User("u-1".into())));
        assert_eq!("circle:42".parse(), Ok(Topic::Circle("42".into())));
    }

    #[test]
    fn display_is_the_canonical_string() {
        for raw in ["posts", "responses", "post:9", "user:abc_1", "circle:42"] {
            let topic: Topic = raw.parse().unwrap();
            assert_eq!(topic.to_string(), raw);
        }
    }

    #[test]
    fn rejects_unknown_kinds_and_bad_scopes() {
        for raw in [
            "",
            "everything",
            "Posts",
            "posts:1",
            "room:1",
            "circle:",
            "circle:4:2",
            "user:a b",
            ":42",
        ] {
            assert!(raw.parse::<Topic>().is_err(), "{raw:?} should not parse");
        }
    }

    #[test]
    fn global_topics_have_no_scope() {
        assert_eq!(Topic::Posts.scope_id(), None);
        assert_eq!(Topic::Circle("42".into()).scope_id(), Some("42"));
    }
}
