//! Restore rule matching

use crate::crd::RestoreRule;

/// What to restore on one host
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RestoreOptions {
    /// Host being restored
    pub host: String,
    /// Host whose backup is restored
    pub source_host: String,
    /// Paths to restore
    pub paths: Vec<String>,
    /// Snapshots to restore from
    pub snapshots: Vec<String>,
}

/// Pick the rule for `hostname`.
///
/// A rule listing the host explicitly wins as soon as it is found. A rule
/// with no target hosts matches any host, but scanning continues in case a
/// later rule names the host; the last such rule is used otherwise.
pub fn restore_options_for_host(hostname: &str, rules: &[RestoreRule]) -> Option<RestoreOptions> {
    let mut matched: Option<&RestoreRule> = None;
    for rule in rules {
        if rule.target_hosts.is_empty() {
            matched = Some(rule);
        } else if rule.target_hosts.iter().any(|h| h == hostname) {
            matched = Some(rule);
            break;
        }
    }

    matched.map(|rule| RestoreOptions {
        host: hostname.to_string(),
        source_host: rule
            .source_host
            .clone()
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| hostname.to_string()),
        paths: rule.paths.clone(),
        snapshots: rule.snapshots.clone(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rule(hosts: &[&str], paths: &[&str]) -> RestoreRule {
        RestoreRule {
            target_hosts: hosts.iter().map(|s| s.to_string()).collect(),
            paths: paths.iter().map(|s| s.to_string()).collect(),
            ..Default::default()
        }
    }

    #[test]
    fn explicit_host_beats_earlier_wildcard() {
        let rules = vec![rule(&[], &["p1"]), rule(&["h1"], &["p2"])];
        let opts = restore_options_for_host("h1", &rules).unwrap();
        assert_eq!(opts.paths, vec!["p2".to_string()]);
        assert_eq!(opts.source_host, "h1");
    }

    #[test]
    fn wildcard_used_when_no_explicit_match() {
        let rules = vec![rule(&[], &["p1"]), rule(&["h2"], &["p2"])];
        let opts = restore_options_for_host("h1", &rules).unwrap();
        assert_eq!(opts.paths, vec!["p1".to_string()]);
    }

    #[test]
    fn no_match_without_wildcard() {
        let rules = vec![rule(&["h2"], &["p2"])];
        assert!(restore_options_for_host("h1", &rules).is_none());
        assert!(restore_options_for_host("h1", &[]).is_none());
    }

    #[test]
    fn source_host_override() {
        let mut r = rule(&[], &["/var/lib/postgresql"]);
        r.source_host = Some("pg-0".to_string());
        r.snapshots = vec!["4bc21a1f".to_string()];
        let opts = restore_options_for_host("host-0", &[r]).unwrap();
        assert_eq!(opts.source_host, "pg-0");
        assert_eq!(opts.snapshots, vec!["4bc21a1f".to_string()]);
    }
}
