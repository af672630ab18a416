use std::fs;

use peerchain::pathmap::{self, PathMapRule, is_different, load_rules, reconcile, resolver};

#[test]
fn client_rules_merge_with_the_agent_map_from_files() {
    let dir = tempfile::tempdir().unwrap();
    let client = dir.path().join("client.yaml");
    let agent = dir.path().join("agent.yaml");
    fs::write(
        &client,
        "- source: /work\n  destination: /home/dev/work\n- source: /opt\n  destination: /mnt/opt\n",
    )
    .unwrap();
    fs::write(
        &agent,
        "- source: /opt\n  destination: /mnt/opt\n  id: agent-1\n  owner: agent\n- source: /old\n  destination: /gone\n  id: laptop:/old=>/gone\n",
    )
    .unwrap();

    let client_rules = load_rules(&client).unwrap();
    let agent_rules = load_rules(&agent).unwrap();
    let merged = reconcile(&client_rules, &agent_rules, "laptop");

    let sources: Vec<&str> = merged.iter().map(|r| r.source.as_str()).collect();
    assert_eq!(sources, ["/opt", "/work"]);
    assert!(merged[0].is_agent());
    assert!(merged[1].is_owned_by("laptop"));
    assert!(is_different(&merged, Some(&agent_rules)));

    // a second round against what was pushed is stable
    let pushed = pathmap::strip_for_push(&merged);
    let mut agent_after = agent_rules.iter().filter(|r| r.is_agent()).cloned().collect::<Vec<_>>();
    agent_after.extend(pushed);
    let again = reconcile(&client_rules, &agent_after, "laptop");
    assert!(!is_different(&again, Some(&agent_after)));
}

#[test]
fn missing_and_empty_rule_files() {
    let dir = tempfile::tempdir().unwrap();
    assert!(load_rules(&dir.path().join("none.yaml")).is_err());
    let empty = dir.path().join("empty.yaml");
    fs::write(&empty, "\n").unwrap();
    assert!(load_rules(&empty).unwrap().is_empty());
}

#[test]
fn host_and_target_paths_translate_both_ways() {
    let rules = vec![
        PathMapRule::new("/target/src", "/host/src"),
        PathMapRule::new("/cygdrive/c/build", "/cygdrive/d/build"),
    ];
    assert_eq!(resolver::find_host_path(&rules, "/target/src/main.c").as_deref(), Some("/host/src/main.c"));
    assert_eq!(resolver::find_target_path(&rules, "/host/src/main.c").as_deref(), Some("/target/src/main.c"));
    assert_eq!(resolver::find_host_path(&rules, "/cygdrive/c/build/out.o").as_deref(), Some("d:/build/out.o"));
    assert_eq!(resolver::find_host_path(&rules, "/target/srcs/x"), None);
}
