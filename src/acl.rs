//! In-process ACL checker and service-account validation.
//!
//! Pool-group config, ACL rules, and service-account issuance are
//! genuinely external systems in a real deployment; this is the small
//! in-process stand-in that lets `Scheduler::schedule` enforce pool
//! access the same way a production ACL service would, without owning
//! that service's ingestion pipeline.

use std::collections::BTreeMap;

use crate::error::SwarmError;
use crate::model::ServiceAccount;

/// Checks whether a service account may submit work to a pool.
pub trait AclChecker: Send + Sync {
    fn check(&self, pool: &str, service_account: &ServiceAccount) -> Result<(), SwarmError>;
}

/// Per-pool allowlist of permitted service accounts. A pool absent from
/// the map has no configured policy and is left open — the same
/// "permit unless restricted" default the standalone crate needs to run
/// without an external policy source.
#[derive(Debug, Clone, Default)]
pub struct InMemoryAclChecker {
    pool_allowlists: BTreeMap<String, Vec<String>>,
}

impl InMemoryAclChecker {
    pub fn new(pool_allowlists: BTreeMap<String, Vec<String>>) -> Self {
        Self { pool_allowlists }
    }
}

impl AclChecker for InMemoryAclChecker {
    fn check(&self, pool: &str, service_account: &ServiceAccount) -> Result<(), SwarmError> {
        let Some(allowed) = self.pool_allowlists.get(pool) else {
            return Ok(());
        };

        match service_account {
            ServiceAccount::None => Err(SwarmError::Forbidden(format!(
                "pool {pool} requires an authenticated service account"
            ))),
            ServiceAccount::Bot => {
                if allowed.iter().any(|a| a == "bot") {
                    Ok(())
                } else {
                    Err(SwarmError::Forbidden(format!(
                        "bot service account not permitted on pool {pool}"
                    )))
                }
            }
            ServiceAccount::Email(email) => {
                if !is_well_formed_email(email) {
                    return Err(SwarmError::FailedPrecondition(format!(
                        "service account {email:?} is not a well-formed email"
                    )));
                }
                if allowed.iter().any(|a| a == email) {
                    Ok(())
                } else {
                    Err(SwarmError::Forbidden(format!(
                        "{email} not permitted on pool {pool}"
                    )))
                }
            }
        }
    }
}

/// Minimal shape check, not full RFC 5322 validation: one `@`, a
/// non-empty local part and domain part.
fn is_well_formed_email(email: &str) -> bool {
    match email.split_once('@') {
        Some((local, domain)) => !local.is_empty() && domain.contains('.') && !domain.starts_with('.'),
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_without_policy_permits_anyone() {
        let acl = InMemoryAclChecker::default();
        assert!(acl.check("open-pool", &ServiceAccount::None).is_ok());
    }

    #[test]
    fn unauthenticated_caller_rejected_on_restricted_pool() {
        let acl = InMemoryAclChecker::new(BTreeMap::from([(
            "restricted".to_string(),
            vec!["ops@example.com".to_string()],
        )]));
        assert!(matches!(
            acl.check("restricted", &ServiceAccount::None),
            Err(SwarmError::Forbidden(_))
        ));
    }

    #[test]
    fn allowlisted_email_permitted() {
        let acl = InMemoryAclChecker::new(BTreeMap::from([(
            "restricted".to_string(),
            vec!["ops@example.com".to_string()],
        )]));
        assert!(acl
            .check("restricted", &ServiceAccount::Email("ops@example.com".to_string()))
            .is_ok());
    }

    #[test]
    fn malformed_email_is_failed_precondition_not_forbidden() {
        let acl = InMemoryAclChecker::new(BTreeMap::from([(
            "restricted".to_string(),
            vec!["ops@example.com".to_string()],
        )]));
        assert!(matches!(
            acl.check("restricted", &ServiceAccount::Email("not-an-email".to_string())),
            Err(SwarmError::FailedPrecondition(_))
        ));
    }

    #[test]
    fn non_allowlisted_email_rejected() {
        let acl = InMemoryAclChecker::new(BTreeMap::from([(
            "restricted".to_string(),
            vec!["ops@example.com".to_string()],
        )]));
        assert!(matches!(
            acl.check("restricted", &ServiceAccount::Email("other@example.com".to_string())),
            Err(SwarmError::Forbidden(_))
        ));
    }
}
