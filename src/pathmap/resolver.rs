//! Translate file names through path-map rules.

use std::{net::IpAddr, path::Path};

use super::rule::PathMapRule;

/// Map an agent-side `path` to this host through `rule`.
pub fn map(rule: &PathMapRule, path: &str) -> Option<String> {
    translate(&rule.source, &rule.destination, rule.host.as_deref(), path)
}

/// Map a host-side `path` back to the agent through `rule`.
pub fn map_reverse(rule: &PathMapRule, path: &str) -> Option<String> {
    translate(&rule.destination, &rule.source, rule.host.as_deref(), path)
}

fn translate(from: &str, to: &str, host: Option<&str>, path: &str) -> Option<String> {
    if !is_prefix_of(from, path) {
        return None;
    }
    if let Some(host) = host.filter(|h| !h.is_empty()) {
        if !is_local_host(host) {
            return None;
        }
    }
    if to.is_empty() {
        return None;
    }
    let mut rest = path.get(from.len()..).unwrap_or("");
    if to.ends_with('/') {
        rest = rest.strip_prefix('/').unwrap_or(rest);
    } else if !rest.is_empty() && !rest.starts_with('/') {
        return Some(normalize(&format!("{to}/{rest}")));
    }
    Some(normalize(&format!("{to}{rest}")))
}

/// First unrestricted rule that maps `agent_path` to this host.
pub fn find_host_path(rules: &[PathMapRule], agent_path: &str) -> Option<String> {
    rules
        .iter()
        .filter(|r| r.is_unrestricted())
        .find_map(|r| map(r, agent_path))
        .map(|p| from_cygdrive(&p))
}

/// Like [`find_host_path`], but only accepts results that exist on disk.
pub fn find_existing_host_path(rules: &[PathMapRule], agent_path: &str) -> Option<String> {
    rules
        .iter()
        .filter(|r| r.is_unrestricted())
        .filter_map(|r| map(r, agent_path).map(|p| from_cygdrive(&p)))
        .find(|p| Path::new(p).exists())
}

/// First unrestricted rule that maps `host_path` back to the agent.
pub fn find_target_path(rules: &[PathMapRule], host_path: &str) -> Option<String> {
    rules
        .iter()
        .filter(|r| r.is_unrestricted())
        .find_map(|r| map_reverse(r, host_path))
}

/// `/cygdrive/c/x` becomes `c:/x`.
fn from_cygdrive(path: &str) -> String {
    const PREFIX: &str = "/cygdrive/";
    match path.strip_prefix(PREFIX) {
        Some(rest) if !rest.is_empty() && rest.is_char_boundary(1) => {
            let (drive, tail) = rest.split_at(1);
            format!("{drive}:{tail}")
        }
        _ => path.to_string(),
    }
}

fn segments(path: &str) -> impl Iterator<Item = &str> {
    path.split(['/', '\\']).filter(|s| !s.is_empty())
}

fn is_absolute(path: &str) -> bool {
    path.starts_with('/') || path.starts_with('\\')
}

/// Segment-wise prefix test, so `/a/b` is a prefix of `/a/b/c` but not of `/a/bc`.
fn is_prefix_of(prefix: &str, path: &str) -> bool {
    if prefix.is_empty() || is_absolute(prefix) != is_absolute(path) {
        return false;
    }
    let mut full = segments(path);
    segments(prefix).all(|seg| full.next() == Some(seg))
}

/// Collapse repeated separators and use `/` throughout.
fn normalize(path: &str) -> String {
    let mut out = String::with_capacity(path.len());
    let mut last_slash = false;
    for c in path.chars() {
        let c = if c == '\\' { '/' } else { c };
        if c == '/' {
            if !last_slash {
                out.push(c);
            }
            last_slash = true;
        } else {
            out.push(c);
            last_slash = false;
        }
    }
    out
}

fn is_local_host(host: &str) -> bool {
    if host.eq_ignore_ascii_case("localhost") {
        return true;
    }
    if let Ok(ip) = host.parse::<IpAddr>() {
        return ip.is_loopback();
    }
    std::env::var("HOSTNAME")
        .map(|name| name.eq_ignore_ascii_case(host))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_on_segment_boundaries() {
        let rule = PathMapRule::new("/build/src", "/home/me/src");
        assert_eq!(map(&rule, "/build/src/main.c").as_deref(), Some("/home/me/src/main.c"));
        assert_eq!(map(&rule, "/build/srcfoo/main.c"), None);
        assert_eq!(map(&rule, "/other/main.c"), None);
    }

    #[test]
    fn trailing_slash_on_destination_is_not_doubled() {
        let rule = PathMapRule::new("/build", "/home/me/");
        assert_eq!(map(&rule, "/build/a.c").as_deref(), Some("/home/me/a.c"));
    }

    #[test]
    fn reverse_maps_back() {
        let rule = PathMapRule::new("/build/src", "/home/me/src");
        assert_eq!(map_reverse(&rule, "/home/me/src/x/y.c").as_deref(), Some("/build/src/x/y.c"));
    }

    #[test]
    fn empty_destination_maps_nothing() {
        let rule = PathMapRule::new("/build", "");
        assert_eq!(map(&rule, "/build/a.c"), None);
    }

    #[test]
    fn remote_host_rules_do_not_apply() {
        let mut rule = PathMapRule::new("/build", "/home");
        rule.host = Some("build-server.example.org".into());
        assert_eq!(map(&rule, "/build/a.c"), None);
        rule.host = Some("127.0.0.1".into());
        assert_eq!(map(&rule, "/build/a.c").as_deref(), Some("/home/a.c"));
    }

    #[test]
    fn find_skips_context_restricted_rules() {
        let mut restricted = PathMapRule::new("/build", "/restricted");
        restricted.context_query = Some("Name=foo".into());
        let mut wildcard = PathMapRule::new("/build", "/open");
        wildcard.context_query = Some("*".into());

        let rules = vec![restricted, wildcard];
        assert_eq!(find_host_path(&rules, "/build/a.c").as_deref(), Some("/open/a.c"));
        assert_eq!(find_target_path(&rules, "/open/a.c").as_deref(), Some("/build/a.c"));
    }

    #[test]
    fn cygdrive_prefix_becomes_a_drive_letter() {
        let rules = vec![PathMapRule::new("/src", "/cygdrive/c/work")];
        assert_eq!(find_host_path(&rules, "/src/a.c").as_deref(), Some("c:/work/a.c"));
    }

    #[test]
    fn existing_host_path_checks_the_filesystem() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.c"), "int main;").unwrap();
        let dest = dir.path().to_string_lossy().replace('\\', "/");
        let rules = vec![PathMapRule::new("/src", dest)];
        assert!(find_existing_host_path(&rules, "/src/a.c").is_some());
        assert!(find_existing_host_path(&rules, "/src/missing.c").is_none());
    }
}
