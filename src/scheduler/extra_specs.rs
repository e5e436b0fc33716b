//! Extra-Spec Matching
//!
//! Operators understood in volume-type extra-specs when they are compared to
//! backend capabilities:
//!
//! | Form              | Meaning                                  |
//! |-------------------|------------------------------------------|
//! | `<is> True`       | boolean equality                         |
//! | `== 10`, `!= 10`  | numeric (in)equality                     |
//! | `>= 10`, `<= 10`  | numeric comparison                       |
//! | `s== abc`, `s!=`  | string (in)equality                      |
//! | `<in> abc`        | substring                                |
//! | `<or> a <or> b`   | any of                                   |
//! | `plain`           | string equality, booleans case-insensitive |

use crate::controlplane::config::parse_bool;

/// Bare extra-spec keys that are compared to capabilities
const CAPABILITY_KEYS: &[&str] = &[
    "compression_support",
    "replication_enabled",
    "thin_provisioning_support",
    "thick_provisioning_support",
    "multiattach",
    "qos_support",
    "storage_protocol",
];

const CAPABILITY_SCOPE: &str = "capabilities:";

/// Capability an extra-spec key refers to, if any.
///
/// Keys in other scopes (`qos:`, vendor prefixes) are opaque driver input.
pub fn capability_key(spec_key: &str) -> Option<&str> {
    if let Some(key) = spec_key.strip_prefix(CAPABILITY_SCOPE) {
        return Some(key);
    }
    if spec_key.contains(':') {
        return None;
    }
    CAPABILITY_KEYS.iter().find(|k| **k == spec_key).copied()
}

/// Check a capability value against an extra-spec requirement
pub fn matches(requirement: &str, actual: Option<&str>) -> bool {
    let Some(actual) = actual else {
        return false;
    };
    let requirement = requirement.trim();
    let actual = actual.trim();

    if let Some(rest) = requirement.strip_prefix("<is>") {
        return match (parse_bool(rest), parse_bool(actual)) {
            (Some(want), Some(have)) => want == have,
            _ => false,
        };
    }
    if requirement.starts_with("<or>") || requirement.contains(" <or> ") {
        return requirement
            .split("<or>")
            .map(str::trim)
            .filter(|alt| !alt.is_empty())
            .any(|alt| alt == actual);
    }
    if let Some(rest) = requirement.strip_prefix("<in>") {
        return actual.contains(rest.trim());
    }
    if let Some(rest) = requirement.strip_prefix("s==") {
        return actual == rest.trim();
    }
    if let Some(rest) = requirement.strip_prefix("s!=") {
        return actual != rest.trim();
    }
    for (op, cmp) in NUMERIC_OPS {
        if let Some(rest) = requirement.strip_prefix(op) {
            return match (rest.trim().parse::<f64>(), actual.parse::<f64>()) {
                (Ok(want), Ok(have)) => cmp(have, want),
                _ => false,
            };
        }
    }

    match (parse_bool(requirement), parse_bool(actual)) {
        (Some(want), Some(have)) => want == have,
        _ => requirement == actual,
    }
}

type NumericCmp = fn(f64, f64) -> bool;

// Two-character operators first so `>=` is not read as `>`
const NUMERIC_OPS: [(&str, NumericCmp); 6] = [
    (">=", |have, want| have >= want),
    ("<=", |have, want| have <= want),
    ("==", |have, want| (have - want).abs() < f64::EPSILON),
    ("!=", |have, want| (have - want).abs() >= f64::EPSILON),
    (">", |have, want| have > want),
    ("<", |have, want| have < want),
];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capability_keys() {
        assert_eq!(capability_key("capabilities:dedup"), Some("dedup"));
        assert_eq!(capability_key("compression_support"), Some("compression_support"));
        assert_eq!(capability_key("qos:maxIOPS"), None);
        assert_eq!(capability_key("volume_backend_name"), None);
        assert_eq!(capability_key("vendor:raid_level"), None);
    }

    #[test]
    fn test_is_operator() {
        assert!(matches("<is> True", Some("True")));
        assert!(matches("<is> true", Some("True")));
        assert!(!matches("<is> True", Some("False")));
        assert!(matches("<is> False", Some("False")));
        assert!(!matches("<is> True", None));
    }

    #[test]
    fn test_numeric_operators() {
        assert!(matches(">= 100", Some("250.5")));
        assert!(!matches(">= 100", Some("99")));
        assert!(matches("<= 4", Some("4")));
        assert!(matches("== 3", Some("3.0")));
        assert!(matches("!= 3", Some("4")));
        assert!(!matches(">= 100", Some("lots")));
    }

    #[test]
    fn test_string_operators() {
        assert!(matches("s== iSCSI", Some("iSCSI")));
        assert!(!matches("s== iscsi", Some("iSCSI")));
        assert!(matches("s!= FC", Some("iSCSI")));
        assert!(matches("<in> gold", Some("pool-gold-1")));
        assert!(matches("<or> iSCSI <or> FC", Some("FC")));
        assert!(!matches("<or> iSCSI <or> FC", Some("NFS")));
    }

    #[test]
    fn test_plain_values() {
        assert!(matches("iSCSI", Some("iSCSI")));
        assert!(matches("true", Some("True")));
        assert!(!matches("FC", Some("iSCSI")));
    }
}
