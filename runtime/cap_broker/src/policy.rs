//! Entitlement policy
//!
//! The bridge authority never decides on its own which rights a user may
//! hold. It asks an [`EntitlementPolicy`], and grants the intersection of
//! what was requested and what the policy allows.

use std::collections::HashMap;

use crate::handle::SubjectId;
use crate::rights::CapRights;

/// Source of truth for what a subject may hold on a resource
pub trait EntitlementPolicy: Send + Sync {
    /// Rights `subject` is entitled to on the resource named by `descriptor`
    ///
    /// Returning an empty mask means "nothing", which the authority turns
    /// into a denial.
    fn entitled_rights(&self, subject: SubjectId, descriptor: &[u8]) -> CapRights;
}

/// Table-driven policy keyed by subject and resource descriptor prefix
///
/// The longest matching prefix wins. Subjects without a matching rule get
/// the default rights (empty unless set).
#[derive(Debug, Default, Clone)]
pub struct StaticEntitlements {
    rules: HashMap<SubjectId, Vec<(Vec<u8>, CapRights)>>,
    default: CapRights,
}

impl StaticEntitlements {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rights granted when no rule matches
    pub fn with_default(mut self, rights: CapRights) -> Self {
        self.default = rights;
        self
    }

    /// Entitle `subject` to `rights` on every resource starting with `prefix`
    pub fn grant(
        mut self,
        subject: SubjectId,
        prefix: impl Into<Vec<u8>>,
        rights: CapRights,
    ) -> Self {
        self.rules
            .entry(subject)
            .or_default()
            .push((prefix.into(), rights));
        self
    }
}

impl EntitlementPolicy for StaticEntitlements {
    fn entitled_rights(&self, subject: SubjectId, descriptor: &[u8]) -> CapRights {
        self.rules
            .get(&subject)
            .and_then(|rules| {
                rules
                    .iter()
                    .filter(|(prefix, _)| descriptor.starts_with(prefix))
                    .max_by_key(|(prefix, _)| prefix.len())
            })
            .map(|(_, rights)| *rights)
            .unwrap_or(self.default)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_longest_prefix_wins() {
        let policy = StaticEntitlements::new()
            .grant(SubjectId(7), "/data", CapRights::READ)
            .grant(SubjectId(7), "/data/shared", CapRights::READ_WRITE);

        assert_eq!(policy.entitled_rights(SubjectId(7), b"/data/private"), CapRights::READ);
        assert_eq!(
            policy.entitled_rights(SubjectId(7), b"/data/shared/x"),
            CapRights::READ_WRITE
        );
    }

    #[test]
    fn test_default_applies_to_unknown_subject() {
        let policy = StaticEntitlements::new()
            .with_default(CapRights::READ)
            .grant(SubjectId(1), "/", CapRights::all());

        assert_eq!(policy.entitled_rights(SubjectId(2), b"/etc"), CapRights::READ);
        assert_eq!(policy.entitled_rights(SubjectId(1), b"/etc"), CapRights::all());
    }

    #[test]
    fn test_no_rule_no_default_is_empty() {
        let policy = StaticEntitlements::new();
        assert!(policy.entitled_rights(SubjectId(3), b"/x").is_empty());
    }
}
