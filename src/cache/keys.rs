//! Structured cache key scheme (spec §6). A typed [`CacheKey`] with
//! `Display`/`FromStr`, grounded on the teacher's cache-type wire-format
//! conventions (`caddy::enterprise::cache::codec`) so `parseCacheKey`'s
//! round-trip law has a concrete type to round-trip through.

use std::fmt;
use std::str::FromStr;

/// `namespace:entityType:identifier[:version]`. `identifier` may itself
/// contain colons; `namespace`, `entity_type`, and `version` may not — this
/// mirrors the round-trip law in spec §8, which only holds under that
/// constraint.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub namespace: String,
    pub entity_type: String,
    pub identifier: String,
    pub version: Option<String>,
}

impl CacheKey {
    pub fn new(namespace: impl Into<String>, entity_type: impl Into<String>, identifier: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            entity_type: entity_type.into(),
            identifier: identifier.into(),
            version: None,
        }
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.namespace, self.entity_type, self.identifier)?;
        if let Some(v) = &self.version {
            write!(f, ":{v}")?;
        }
        Ok(())
    }
}

impl FromStr for CacheKey {
    type Err = ();

    /// The inverse of `Display`. Returns `Err` for strings with fewer than
    /// three colon-separated parts, matching `parseCacheKey`'s contract.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split(':').collect();
        if parts.len() < 3 {
            return Err(());
        }
        let namespace = parts[0].to_string();
        let entity_type = parts[1].to_string();
        // identifier absorbs everything up to (but not including) a trailing
        // version segment; without a marker for "this build has no version"
        // we treat a 3-part key as having no version and a 4+-part key's
        // last segment as the version, mirroring buildCacheKey's shape.
        if parts.len() == 3 {
            Ok(Self {
                namespace,
                entity_type,
                identifier: parts[2].to_string(),
                version: None,
            })
        } else {
            let version = parts[parts.len() - 1].to_string();
            let identifier = parts[2..parts.len() - 1].join(":");
            Ok(Self {
                namespace,
                entity_type,
                identifier,
                version: Some(version),
            })
        }
    }
}

/// `buildCacheKey(ns, entity, id[, v]) = ns:entity:id[:v]`.
pub fn build_cache_key(ns: &str, entity: &str, id: &str, version: Option<&str>) -> String {
    match version {
        Some(v) => format!("{ns}:{entity}:{id}:{v}"),
        None => format!("{ns}:{entity}:{id}"),
    }
}

/// The inverse of [`build_cache_key`]; absent for fewer than 3 parts.
pub fn parse_cache_key(key: &str) -> Option<CacheKey> {
    CacheKey::from_str(key).ok()
}

pub fn user_vault(user_id: &str) -> String {
    format!("vault:user:{user_id}")
}

pub fn user_position(user_id: &str, guild_id: &str) -> String {
    format!("lb:user:{user_id}:guild:{guild_id}")
}

pub fn guild_leaderboard(guild_id: &str) -> String {
    format!("lb:guild:{guild_id}")
}

pub fn tenant_config(guild_id: &str) -> String {
    format!("cfg:guild:{guild_id}")
}

pub fn rpc_balance(wallet_addr: &str) -> String {
    format!("rpc:wallet:{}", wallet_addr.to_lowercase())
}

pub fn token_metadata(token: &str) -> String {
    format!("token:token:{}", token.to_lowercase())
}

pub fn guild_stats(guild_id: &str) -> String {
    format!("guild:agg:{guild_id}")
}

pub fn generic(entity_type: &str, id: &str) -> String {
    format!("gen:{entity_type}:{id}")
}

pub mod invalidation_patterns {
    pub fn all_for_user(user_id: &str) -> String {
        format!("vault:user:{user_id}")
    }

    pub fn guild_leaderboard(guild_id: &str) -> String {
        super::guild_leaderboard(guild_id)
    }

    pub fn all_user_positions_in_guild() -> String {
        "lb:user:".to_string()
    }

    pub fn tenant_config(guild_id: &str) -> String {
        super::tenant_config(guild_id)
    }

    pub fn all_rpc() -> String {
        "rpc:".to_string()
    }

    pub fn namespace(ns: &str) -> String {
        format!("{ns}:")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_and_parse_round_trip_without_version() {
        let built_simple = build_cache_key("vault", "user", "abc", None);
        let parsed = parse_cache_key(&built_simple).unwrap();
        assert_eq!(parsed.namespace, "vault");
        assert_eq!(parsed.entity_type, "user");
        assert_eq!(parsed.identifier, "abc");
        assert_eq!(parsed.version, None);
    }

    #[test]
    fn build_and_parse_round_trip_with_version() {
        let built = build_cache_key("vault", "user", "abc", Some("v2"));
        let parsed = parse_cache_key(&built).unwrap();
        assert_eq!(parsed.identifier, "abc");
        assert_eq!(parsed.version, Some("v2".to_string()));
    }

    #[test]
    fn parse_rejects_short_strings() {
        assert!(parse_cache_key("only:two").is_none());
        assert!(parse_cache_key("onlyone").is_none());
    }

    #[test]
    fn reserved_helpers_match_spec_strings() {
        assert_eq!(user_vault("u1"), "vault:user:u1");
        assert_eq!(user_position("u1", "g1"), "lb:user:u1:guild:g1");
        assert_eq!(guild_leaderboard("g1"), "lb:guild:g1");
        assert_eq!(tenant_config("g1"), "cfg:guild:g1");
        assert_eq!(rpc_balance("0xABC"), "rpc:wallet:0xabc");
        assert_eq!(token_metadata("TOK"), "token:token:tok");
        assert_eq!(guild_stats("g1"), "guild:agg:g1");
        assert_eq!(generic("t", "id1"), "gen:t:id1");
    }

    #[test]
    fn invalidation_pattern_helpers_match_spec_strings() {
        use invalidation_patterns::*;
        assert_eq!(all_for_user("u1"), "vault:user:u1");
        assert_eq!(all_user_positions_in_guild(), "lb:user:");
        assert_eq!(all_rpc(), "rpc:");
        assert_eq!(namespace("lb"), "lb:");
        assert_eq!(namespace("cfg"), "cfg:");
    }
}
