//! Host-port triples stay disjoint across any number of coexisting
//! worktrees, and legacy worktrees without triples are tolerated.

use std::collections::BTreeSet;
use std::path::PathBuf;

use dockertree_core::envgen::{allocate_triple, generate, used_ports, PortTriple};
use dockertree_core::paths::ProjectContext;
use dockertree_core::ProjectConfig;

fn write_env(root: &std::path::Path, branch: &str, ports: PortTriple) -> PathBuf {
    let config = ProjectConfig::new("myapp");
    let worktree = root.join("worktrees").join(branch);
    let env = generate(&config, branch, &worktree, ports);
    let path = ProjectContext::env_file_path(&worktree);
    env.store(&path).unwrap();
    path
}

#[test]
fn triples_are_disjoint_across_many_worktrees() {
    let tmp = tempfile::tempdir().unwrap();
    let mut env_paths = Vec::new();
    let mut seen = BTreeSet::new();

    for i in 0..20 {
        let used = used_ports(&env_paths);
        let triple = allocate_triple(&used).unwrap();

        // No overlap with anything allocated before.
        assert!(seen.insert(triple.db), "db port reused at iteration {i}");
        assert!(seen.insert(triple.redis), "redis port reused at iteration {i}");
        assert!(seen.insert(triple.web), "web port reused at iteration {i}");

        env_paths.push(write_env(tmp.path(), &format!("feature-{i}"), triple));
    }
}

#[test]
fn legacy_env_files_without_triples_are_ignored() {
    let tmp = tempfile::tempdir().unwrap();
    let legacy = tmp.path().join("worktrees/legacy/.dockertree/env.dockertree");
    std::fs::create_dir_all(legacy.parent().unwrap()).unwrap();
    std::fs::write(&legacy, "COMPOSE_PROJECT_NAME=myapp-legacy\n").unwrap();

    let used = used_ports(&[legacy]);
    assert!(used.is_empty());
    // Allocation proceeds from the range starts.
    let triple = allocate_triple(&used).unwrap();
    assert_eq!(triple.db, 55000);
}

#[test]
fn generated_env_files_feed_back_into_allocation() {
    let tmp = tempfile::tempdir().unwrap();
    let first = allocate_triple(&BTreeSet::new()).unwrap();
    let path = write_env(tmp.path(), "feature-a", first);

    let used = used_ports(std::slice::from_ref(&path));
    let second = allocate_triple(&used).unwrap();
    assert_ne!(first.db, second.db);
    assert_ne!(first.redis, second.redis);
    assert_ne!(first.web, second.web);
}
