//! Tier→capability resolver (spec §4.5): a pure, total function from an
//! integer tier to an admission class and a set of permitted capability
//! aliases. Grounded on `caddy::enterprise::ratelimit::quota::QuotaIdentifier`
//! for the class/alias modeling; the mapping itself is defined by the spec.

use crate::config::AdmissionClass;
use crate::error::{GatekeeperError, Result};

pub const CHEAP: &str = "cheap";
pub const FAST_CODE: &str = "fast-code";
pub const REVIEWER: &str = "reviewer";
pub const REASONING: &str = "reasoning";
pub const NATIVE: &str = "native";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TierDescriptor {
    pub tier: i64,
    pub class: AdmissionClass,
    pub allowed_aliases: Vec<&'static str>,
}

/// Tiers 1-3 -> free -> {cheap}; 4-6 -> pro -> {cheap, fast-code, reviewer};
/// 7-9 -> enterprise -> {cheap, fast-code, reviewer, reasoning, native}.
pub fn resolve(tier: i64) -> Result<TierDescriptor> {
    let (class, allowed_aliases) = match tier {
        1..=3 => (AdmissionClass::Free, vec![CHEAP]),
        4..=6 => (AdmissionClass::Pro, vec![CHEAP, FAST_CODE, REVIEWER]),
        7..=9 => (
            AdmissionClass::Enterprise,
            vec![CHEAP, FAST_CODE, REVIEWER, REASONING, NATIVE],
        ),
        _ => return Err(GatekeeperError::InvalidTier(tier)),
    };
    Ok(TierDescriptor {
        tier,
        class,
        allowed_aliases,
    })
}

pub fn validate(alias: &str, allowed_aliases: &[&str]) -> bool {
    allowed_aliases.contains(&alias)
}

/// When a non-permitted alias is requested, silently falls back to the
/// tenant's default alias instead of raising an error (anti-escalation).
pub fn resolve_alias<'a>(requested: &str, allowed_aliases: &'a [&'a str], default_alias: &'a str) -> &'a str {
    if validate(requested, allowed_aliases) {
        allowed_aliases
            .iter()
            .find(|a| **a == requested)
            .copied()
            .unwrap_or(default_alias)
    } else {
        default_alias
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tier_mapping_is_total_over_one_to_nine() {
        for tier in 1..=9 {
            assert!(resolve(tier).is_ok());
        }
    }

    #[test]
    fn tier_boundaries_match_documented_alias_sets() {
        assert_eq!(resolve(3).unwrap().class, AdmissionClass::Free);
        assert_eq!(resolve(4).unwrap().class, AdmissionClass::Pro);
        assert_eq!(resolve(6).unwrap().class, AdmissionClass::Pro);
        assert_eq!(resolve(7).unwrap().class, AdmissionClass::Enterprise);
        assert_eq!(resolve(9).unwrap().allowed_aliases, vec![CHEAP, FAST_CODE, REVIEWER, REASONING, NATIVE]);
    }

    #[test]
    fn invalid_tiers_fail_explicitly() {
        assert!(matches!(resolve(0), Err(GatekeeperError::InvalidTier(0))));
        assert!(matches!(resolve(10), Err(GatekeeperError::InvalidTier(10))));
    }

    #[test]
    fn validate_checks_membership() {
        let descriptor = resolve(5).unwrap();
        assert!(validate(CHEAP, &descriptor.allowed_aliases));
        assert!(!validate(NATIVE, &descriptor.allowed_aliases));
    }

    #[test]
    fn disallowed_alias_falls_back_silently() {
        let descriptor = resolve(2).unwrap();
        let resolved = resolve_alias(NATIVE, &descriptor.allowed_aliases, CHEAP);
        assert_eq!(resolved, CHEAP);
    }

    #[test]
    fn allowed_alias_is_returned_unchanged() {
        let descriptor = resolve(8).unwrap();
        let resolved = resolve_alias(REASONING, &descriptor.allowed_aliases, CHEAP);
        assert_eq!(resolved, REASONING);
    }
}
