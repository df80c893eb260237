//! Subscription authorization.
//!
//! | Topic                            | Rule                                     |
//! |----------------------------------|------------------------------------------|
//! | `posts`, `responses`, `post:{id}`| any authenticated identity               |
//! | `user:{id}`                      | only the identity whose id matches       |
//! | `circle:{id}`                    | recorded members of the circle           |
//! | anything else                    | denied as an unknown channel             |
//!
//! A failed membership lookup denies the subscription.

use crate::error::Error;
use crate::identity::{Identity, UserId};
use crate::topic::Topic;
use async_trait::async_trait;
use dashmap::DashMap;
use log::*;
use std::collections::HashSet;
use std::sync::Arc;

/// Answers whether an identity belongs to a support circle.
#[async_trait]
pub trait MembershipLookup: Send + Sync {
    async fn is_circle_member(&self, identity: &Identity, circle_id: &str) -> Result<bool, Error>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DenyReason {
    UnknownChannel,
    NotOwner,
    NotMember,
    MembershipUnavailable,
}

impl DenyReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DenyReason::UnknownChannel => "unknown_channel",
            DenyReason::NotOwner => "not_owner",
            DenyReason::NotMember => "not_member",
            DenyReason::MembershipUnavailable => "membership_unavailable",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Allow(Topic),
    Deny(DenyReason),
}

pub struct ChannelAuthorizer {
    membership: Arc<dyn MembershipLookup>,
}

impl ChannelAuthorizer {
    pub fn new(membership: Arc<dyn MembershipLookup>) -> Self {
        Self { membership }
    }

    /// Decide whether `identity` may subscribe to the raw topic string `topic`.
    pub async fn authorize(&self, identity: &Identity, topic: &str) -> Decision {
        let Ok(parsed) = topic.parse::<Topic>() else {
            return Decision::Deny(DenyReason::UnknownChannel);
        };

        match &parsed {
            Topic::Posts | Topic::Responses | Topic::Post(_) => Decision::Allow(parsed),
            Topic::User(owner_id) => {
                if owner_id == identity.user_id() {
                    Decision::Allow(parsed)
                } else {
                    Decision::Deny(DenyReason::NotOwner)
                }
            }
            Topic::Circle(circle_id) => {
                match self.membership.is_circle_member(identity, circle_id).await {
                    Ok(true) => Decision::Allow(parsed),
                    Ok(false) => Decision::Deny(DenyReason::NotMember),
                    Err(e) => {
                        warn!(
                            "Membership lookup failed for user {} in circle {}: {}",
                            identity.user_id(),
                            circle_id,
                            e
                        );
                        Decision::Deny(DenyReason::MembershipUnavailable)
                    }
                }
            }
        }
    }
}

/// Circle membership held in memory, keyed by circle id.
#[derive(Default)]
pub struct InMemoryMembership {
    circles: DashMap<String, HashSet<UserId>>,
}

impl InMemoryMembership {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_member(&self, circle_id: &str, user_id: &str) {
        self.circles
            .entry(circle_id.to_string())
            .or_default()
            .insert(user_id.to_string());
    }

    pub fn remove_member(&self, circle_id: &str, user_id: &str) {
        if let Some(mut members) = self.circles.get_mut(circle_id) {
            members.remove(user_id);

            if members.is_empty() {
                drop(members); // Release lock before removal
                self.circles.remove(circle_id);
            }
        }
    }
}

#[async_trait]
impl MembershipLookup for InMemoryMembership {
    async fn is_circle_member(&self, identity: &Identity, circle_id: &str) -> Result<bool, Error> {
        Ok(self
            .circles
            .get(circle_id)
            .is_some_and(|members| members.contains(identity.user_id())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{internal_error, InternalErrorKind};

    struct FailingMembership;

    #[async_trait]
    impl MembershipLookup for FailingMembership {
        async fn is_circle_member(&self, _: &Identity, _: &str) -> Result<bool, Error> {
            Err(internal_error(InternalErrorKind::HubUnavailable, "store offline"))
        }
    }

    fn authorizer_with_member(circle_id: &str, user_id: &str) -> ChannelAuthorizer {
        let membership = InMemoryMembership::new();
        membership.add_member(circle_id, user_id);
        ChannelAuthorizer::new(Arc::new(membership))
    }

    fn user(id: &str) -> Identity {
        Identity::new(id, "Someone", false)
    }

    #[tokio::test]
    async fn global_topics_allowed_for_any_identity() {
        let authorizer = authorizer_with_member("1", "nobody");
        for topic in ["posts", "responses", "post:17"] {
            assert_eq!(
                authorizer.authorize(&user("u1"), topic).await,
                Decision::Allow(topic.parse().unwrap())
            );
        }
    }

    #[tokio::test]
    async fn own_user_topic_allowed_other_denied() {
        let authorizer = authorizer_with_member("1", "nobody");

        assert!(matches!(
            authorizer.authorize(&user("u1"), "user:u1").await,
            Decision::Allow(_)
        ));
        assert_eq!(
            authorizer.authorize(&user("u1"), "user:u2").await,
            Decision::Deny(DenyReason::NotOwner)
        );
    }

    #[tokio::test]
    async fn circle_requires_membership() {
        let authorizer = authorizer_with_member("42", "u1");

        assert!(matches!(
            authorizer.authorize(&user("u1"), "circle:42").await,
            Decision::Allow(_)
        ));
        assert_eq!(
            authorizer.authorize(&user("u2"), "circle:42").await,
            Decision::Deny(DenyReason::NotMember)
        );
    }

    #[tokio::test]
    async fn unknown_kinds_are_denied() {
        let authorizer = authorizer_with_member("42", "u1");
        for topic in ["everything", "room:42", "circle:", "*"] {
            assert_eq!(
                authorizer.authorize(&user("u1"), topic).await,
                Decision::Deny(DenyReason::UnknownChannel)
            );
        }
    }

    #[tokio::test]
    async fn lookup_failure_fails_closed() {
        let authorizer = ChannelAuthorizer::new(Arc::new(FailingMembership));
        assert_eq!(
            authorizer.authorize(&user("u1"), "circle:42").await,
            Decision::Deny(DenyReason::MembershipUnavailable)
        );
    }

    #[tokio::test]
    async fn decisions_are_stable_for_a_fixed_snapshot() {
        let authorizer = authorizer_with_member("42", "u1");
        for topic in ["posts", "user:u2", "circle:42", "circle:7", "bogus"] {
            let first = authorizer.authorize(&user("u1"), topic).await;
            let second = authorizer.authorize(&user("u1"), topic).await;
            assert_eq!(first, second);
        }
    }

    #[tokio::test]
    async fn removed_member_loses_access() {
        let membership = Arc::new(InMemoryMembership::new());
        membership.add_member("42", "u1");
        let authorizer = ChannelAuthorizer::new(membership.clone());
        assert!(matches!(
            authorizer.authorize(&user("u1"), "circle:42").await,
            Decision::Allow(_)
        ));

        membership.remove_member("42", "u1");
        assert_eq!(
            authorizer.authorize(&user("u1"), "circle:42").await,
            Decision::Deny(DenyReason::NotMember)
        );
    }
}
