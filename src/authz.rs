//! Role-based authorization policies and the route table that applies them.

use axum::http::Method;

use crate::config::RolesConfig;
use crate::error::AuthError;
use crate::identity::InboundIdentity;

/// Named authorization policies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Policy {
    /// Reader or Writer role.
    RequireReaderRole,
    /// Writer role only.
    RequireWriterRole,
}

impl Policy {
    pub fn name(&self) -> &'static str {
        match self {
            Self::RequireReaderRole => "RequireReaderRole",
            Self::RequireWriterRole => "RequireWriterRole",
        }
    }
}

/// Role names behind each policy, resolved from configuration.
#[derive(Debug, Clone)]
pub struct PolicySet {
    reader: Vec<String>,
    writer: Vec<String>,
}

impl PolicySet {
    pub fn new(roles: &RolesConfig) -> Self {
        Self {
            reader: vec![roles.reader.clone(), roles.writer.clone()],
            writer: vec![roles.writer.clone()],
        }
    }

    /// Roles any one of which satisfies `policy`.
    pub fn required_roles(&self, policy: Policy) -> &[String] {
        match policy {
            Policy::RequireReaderRole => &self.reader,
            Policy::RequireWriterRole => &self.writer,
        }
    }

    /// Check `identity` against `policy`.
    pub fn authorize(&self, policy: Policy, identity: &InboundIdentity) -> Result<(), AuthError> {
        let required = self.required_roles(policy);
        if identity.has_any_role(required) {
            Ok(())
        } else {
            Err(AuthError::Forbidden {
                policy: policy.name(),
                required: required.to_vec(),
            })
        }
    }
}

/// What a route demands of its caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Requirement {
    Anonymous,
    Authenticated,
    Policy(Policy),
}

#[derive(Debug, Clone)]
struct Rule {
    method: Option<Method>,
    prefix: String,
    requirement: Requirement,
}

/// Ordered (method, path prefix) rules. The first match wins.
#[derive(Debug, Clone)]
pub struct RouteTable {
    rules: Vec<Rule>,
    fallback: Requirement,
}

impl Default for RouteTable {
    fn default() -> Self {
        Self {
            rules: Vec::new(),
            fallback: Requirement::Authenticated,
        }
    }
}

impl RouteTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a rule. `None` matches any method.
    pub fn rule(mut self, method: Option<Method>, prefix: &str, requirement: Requirement) -> Self {
        self.rules.push(Rule {
            method,
            prefix: prefix.trim_end_matches('/').to_string(),
            requirement,
        });
        self
    }

    /// Requirement for an unmatched request.
    pub fn fallback(mut self, requirement: Requirement) -> Self {
        self.fallback = requirement;
        self
    }

    pub fn requirement_for(&self, method: &Method, path: &str) -> Requirement {
        self.rules
            .iter()
            .find(|r| {
                (r.method.is_none() || r.method.as_ref() == Some(method))
                    && starts_with_segments(path, &r.prefix)
            })
            .map(|r| r.requirement)
            .unwrap_or(self.fallback)
    }
}

/// Whether `path` is `prefix` or lies below it, compared by whole segments.
pub fn starts_with_segments(path: &str, prefix: &str) -> bool {
    let prefix = prefix.trim_end_matches('/');
    if prefix.is_empty() {
        return true;
    }
    match path.strip_prefix(prefix) {
        Some(rest) => rest.is_empty() || rest.starts_with('/'),
        None => false,
    }
}
