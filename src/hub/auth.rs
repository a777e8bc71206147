//! Invocation authorization.
//!
//! The dispatcher asks an [`Authorizer`] before running any method that has
//! requirements (its own, or the hub's defaults). The crate never
//! authenticates: identity comes from the host, and policies are predicates
//! the host registers.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;

use crate::connection::{ConnectionId, Identity};

/// What a caller must satisfy to invoke a method.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AuthorizationRequirements {
    /// Named policies; every one must pass.
    pub policies: Vec<String>,
    /// Accepted roles; any one suffices. Empty means no role check.
    pub roles: Vec<String>,
    /// Skip every check, including the identity requirement.
    pub allow_anonymous: bool,
}

impl AuthorizationRequirements {
    /// Requires only that the caller has an identity.
    pub fn authenticated() -> Self {
        Self::default()
    }

    /// Lets everyone through.
    pub fn anonymous() -> Self {
        Self {
            allow_anonymous: true,
            ..Self::default()
        }
    }

    /// Add a required policy.
    #[must_use]
    pub fn with_policy(mut self, policy: impl Into<String>) -> Self {
        self.policies.push(policy.into());
        self
    }

    /// Add an accepted role.
    #[must_use]
    pub fn with_role(mut self, role: impl Into<String>) -> Self {
        self.roles.push(role.into());
        self
    }
}

/// Outcome of an authorization check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthorizationResult {
    /// The call may proceed.
    Allowed,
    /// The call is refused.
    Denied(String),
}

impl AuthorizationResult {
    /// Whether the call may proceed.
    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allowed)
    }
}

/// Decides whether a caller may invoke a method.
#[async_trait]
pub trait Authorizer: Send + Sync + 'static {
    /// Check `identity` against `requirements`. `resource` is the calling
    /// connection.
    async fn authorize(
        &self,
        identity: Option<&Identity>,
        resource: &ConnectionId,
        requirements: &AuthorizationRequirements,
    ) -> AuthorizationResult;
}

/// Policy predicate over the caller and the calling connection.
pub type PolicyPredicate = Arc<dyn Fn(&Identity, &ConnectionId) -> bool + Send + Sync>;

/// Default authorizer: roles plus named predicate policies.
///
/// Unknown policies deny.
#[derive(Clone, Default)]
pub struct PolicyAuthorizer {
    policies: HashMap<String, PolicyPredicate>,
}

impl fmt::Debug for PolicyAuthorizer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PolicyAuthorizer")
            .field("policies", &self.policies.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl PolicyAuthorizer {
    /// Authorizer with no policies registered.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a named policy.
    #[must_use]
    pub fn with_policy<F>(mut self, name: impl Into<String>, predicate: F) -> Self
    where
        F: Fn(&Identity, &ConnectionId) -> bool + Send + Sync + 'static,
    {
        self.policies.insert(name.into(), Arc::new(predicate));
        self
    }
}

#[async_trait]
impl Authorizer for PolicyAuthorizer {
    async fn authorize(
        &self,
        identity: Option<&Identity>,
        resource: &ConnectionId,
        requirements: &AuthorizationRequirements,
    ) -> AuthorizationResult {
        if requirements.allow_anonymous {
            return AuthorizationResult::Allowed;
        }
        let Some(identity) = identity else {
            return AuthorizationResult::Denied("authentication required".to_string());
        };

        if !requirements.roles.is_empty()
            && !requirements.roles.iter().any(|role| identity.has_role(role))
        {
            return AuthorizationResult::Denied(format!(
                "{} lacks any of roles {:?}",
                identity.name, requirements.roles
            ));
        }

        for policy in &requirements.policies {
            match self.policies.get(policy) {
                Some(predicate) if predicate(identity, resource) => {}
                Some(_) => {
                    return AuthorizationResult::Denied(format!("policy '{policy}' failed"));
                }
                None => {
                    return AuthorizationResult::Denied(format!("policy '{policy}' is not registered"));
                }
            }
        }
        AuthorizationResult::Allowed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn conn() -> ConnectionId {
        ConnectionId::from("c1")
    }

    #[tokio::test]
    async fn test_anonymous_passes_without_identity() {
        let auth = PolicyAuthorizer::new();
        let result = auth
            .authorize(None, &conn(), &AuthorizationRequirements::anonymous())
            .await;
        assert!(result.is_allowed());
    }

    #[tokio::test]
    async fn test_identity_required_by_default() {
        let auth = PolicyAuthorizer::new();
        let req = AuthorizationRequirements::authenticated();
        assert!(!auth.authorize(None, &conn(), &req).await.is_allowed());
        assert!(auth
            .authorize(Some(&Identity::named("amy")), &conn(), &req)
            .await
            .is_allowed());
    }

    #[tokio::test]
    async fn test_any_role_matches() {
        let auth = PolicyAuthorizer::new();
        let req = AuthorizationRequirements::authenticated()
            .with_role("admin")
            .with_role("ops");
        let ops = Identity::named("o").with_role("ops");
        let guest = Identity::named("g").with_role("guest");
        assert!(auth.authorize(Some(&ops), &conn(), &req).await.is_allowed());
        assert!(!auth.authorize(Some(&guest), &conn(), &req).await.is_allowed());
    }

    #[tokio::test]
    async fn test_policies_must_exist_and_pass() {
        let auth = PolicyAuthorizer::new()
            .with_policy("tenant", |identity, _| identity.claims.contains_key("tenant"));
        let tenant = Identity::named("t").with_claim("tenant", "acme");
        let plain = Identity::named("p");

        let req = AuthorizationRequirements::authenticated().with_policy("tenant");
        assert!(auth.authorize(Some(&tenant), &conn(), &req).await.is_allowed());
        assert!(!auth.authorize(Some(&plain), &conn(), &req).await.is_allowed());

        let unknown = AuthorizationRequirements::authenticated().with_policy("missing");
        assert_eq!(
            auth.authorize(Some(&tenant), &conn(), &unknown).await,
            AuthorizationResult::Denied("policy 'missing' is not registered".to_string())
        );
    }
}
