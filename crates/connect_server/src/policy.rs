//! Accept policies.
//!
//! An [`AcceptPolicyChain`] is evaluated for every raw connection before a
//! session exists. Policies run in registration order and the first one that
//! does not allow the connection ends the evaluation. A policy that fails or
//! panics counts as a denial.

use crate::error::PolicyError;
use crate::registry::SessionRegistry;
use std::collections::HashSet;
use std::net::{IpAddr, SocketAddr};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use tracing::{debug, warn};

/// Outcome of a single policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Allow,
    Deny,
}

/// Veto over incoming connections.
pub trait AcceptPolicy: Send + Sync {
    /// Name used in logs.
    fn name(&self) -> &str;

    /// Decides on a candidate from `endpoint` (`None` if the transport reports none).
    fn decide(&self, endpoint: Option<SocketAddr>) -> Result<Decision, PolicyError>;
}

/// Outcome of evaluating the whole chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Allowed,
    /// The named policy denied the connection
    Denied { policy: String },
    /// The named policy failed; treated as a denial
    Faulted { policy: String, reason: String },
}

impl Verdict {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Verdict::Allowed)
    }
}

/// Ordered, short-circuiting list of accept policies.
#[derive(Default)]
pub struct AcceptPolicyChain {
    policies: Vec<Arc<dyn AcceptPolicy>>,
}

impl AcceptPolicyChain {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a policy. Registration order is evaluation order.
    pub fn push(&mut self, policy: Arc<dyn AcceptPolicy>) {
        self.policies.push(policy);
    }

    pub fn len(&self) -> usize {
        self.policies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.policies.is_empty()
    }

    /// Evaluates the chain for a candidate.
    pub fn evaluate(&self, endpoint: Option<SocketAddr>) -> Verdict {
        for policy in &self.policies {
            let outcome = catch_unwind(AssertUnwindSafe(|| policy.decide(endpoint)));
            match outcome {
                Ok(Ok(Decision::Allow)) => continue,
                Ok(Ok(Decision::Deny)) => {
                    debug!("Connection from {:?} denied by policy '{}'", endpoint, policy.name());
                    return Verdict::Denied {
                        policy: policy.name().to_string(),
                    };
                }
                Ok(Err(e)) => {
                    warn!("Accept policy '{}' failed for {:?}: {}", policy.name(), endpoint, e);
                    return Verdict::Faulted {
                        policy: policy.name().to_string(),
                        reason: e.to_string(),
                    };
                }
                Err(_) => {
                    warn!("Accept policy '{}' panicked for {:?}", policy.name(), endpoint);
                    return Verdict::Faulted {
                        policy: policy.name().to_string(),
                        reason: "policy panicked".to_string(),
                    };
                }
            }
        }
        Verdict::Allowed
    }
}

impl FromIterator<Arc<dyn AcceptPolicy>> for AcceptPolicyChain {
    fn from_iter<I: IntoIterator<Item = Arc<dyn AcceptPolicy>>>(iter: I) -> Self {
        Self {
            policies: iter.into_iter().collect(),
        }
    }
}

/// Denies connections once the registry holds `max_sessions` sessions.
///
/// Connections that were approved but are still handshaking count as held,
/// so a burst of candidates cannot overshoot the cap.
pub struct MaxSessionsPolicy {
    registry: Arc<SessionRegistry>,
    max_sessions: usize,
}

impl MaxSessionsPolicy {
    /// Caps `registry` at `max_sessions`; zero denies every connection.
    pub fn new(registry: Arc<SessionRegistry>, max_sessions: usize) -> Self {
        Self { registry, max_sessions }
    }
}

impl AcceptPolicy for MaxSessionsPolicy {
    fn name(&self) -> &str {
        "max_sessions"
    }

    fn decide(&self, _endpoint: Option<SocketAddr>) -> Result<Decision, PolicyError> {
        if self.registry.occupancy() >= self.max_sessions {
            Ok(Decision::Deny)
        } else {
            Ok(Decision::Allow)
        }
    }
}

/// Denies connections from listed addresses.
///
/// Candidates without an endpoint are let through.
#[derive(Debug, Default)]
pub struct BlocklistPolicy {
    blocked: HashSet<IpAddr>,
}

impl BlocklistPolicy {
    /// Builds the policy from the addresses to refuse.
    pub fn new(blocked: impl IntoIterator<Item = IpAddr>) -> Self {
        Self {
            blocked: blocked.into_iter().collect(),
        }
    }
}

impl AcceptPolicy for BlocklistPolicy {
    fn name(&self) -> &str {
        "blocklist"
    }

    fn decide(&self, endpoint: Option<SocketAddr>) -> Result<Decision, PolicyError> {
        match endpoint {
            Some(endpoint) if self.blocked.contains(&endpoint.ip()) => Ok(Decision::Deny),
            _ => Ok(Decision::Allow),
        }
    }
}
