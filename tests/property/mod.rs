//! Property-based testing for origin-control
//!
//! Uses proptest to check workspace invariants across randomly generated
//! inputs and sequences of task transitions.

use ::origin_control::plan::parse_restrictions;
use ::origin_control::*;
use proptest::prelude::*;
use std::collections::BTreeSet;
use std::fs;
use std::path::PathBuf;
use tempfile::TempDir;
use tracing::info;

use crate::integration::HEADER;

/// A transition requested on one task
#[derive(Debug, Clone)]
pub enum TaskOperation {
    Done(usize),
    Error(usize),
    Retry(usize),
    RetryAll,
}

fn operation_strategy(tasks: usize) -> impl Strategy<Value = TaskOperation> {
    prop_oneof![
        (0..tasks).prop_map(TaskOperation::Done),
        (0..tasks).prop_map(TaskOperation::Error),
        (0..tasks).prop_map(TaskOperation::Retry),
        Just(TaskOperation::RetryAll),
    ]
}

fn package_name_strategy() -> impl Strategy<Value = String> {
    "[a-z][a-z0-9._-]{0,12}"
}

fn restriction_strategy() -> impl Strategy<Value = Restriction> {
    prop_oneof![Just(Restriction::Allow), Just(Restriction::Block)]
}

fn write_plan(dir: &TempDir, packages: &[String]) -> PathBuf {
    let mut content = format!("{}\n", HEADER);
    for package in packages {
        content.push_str(&format!("corp,internal,pypi,,{},BLOCK,ALLOW\n", package));
    }
    let path = dir.path().join("plan.csv");
    fs::write(&path, content).unwrap();
    path
}

fn task_id(package: &str) -> String {
    format!("corp-internal-pypi--{}", package)
}

/// Every task must be in exactly one of the three directories
fn assert_single_membership(workspace: &Workspace, ids: &[String]) {
    for id in ids {
        let mut found = 0;
        for state in [TaskState::Todo, TaskState::Error, TaskState::Done] {
            if workspace.state_dir(state).join(id).is_file() {
                found += 1;
            }
        }
        assert_eq!(found, 1, "task {} is in {} collections", id, found);
    }
    let status = workspace.status().unwrap();
    assert_eq!(status.total(), ids.len());
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn prop_population_matches_unique_keys(
        packages in prop::collection::btree_set(package_name_strategy(), 0..40)
    ) {
        let temp_dir = TempDir::new().unwrap();
        let packages: Vec<String> = packages.into_iter().collect();
        let input = write_plan(&temp_dir, &packages);

        let workspace = Workspace::initialize(&input, &temp_dir.path().join("workspaces")).unwrap();
        let status = workspace.status().unwrap();
        prop_assert_eq!(status.todo, packages.len());
        prop_assert_eq!(status.error + status.done, 0);

        let ids: BTreeSet<String> = workspace.tasks().unwrap().map(|t| t.id().to_string()).collect();
        let expected: BTreeSet<String> = packages.iter().map(|p| task_id(p)).collect();
        prop_assert_eq!(ids, expected);
    }

    #[test]
    fn prop_transitions_keep_single_membership(
        ops in prop::collection::vec(operation_strategy(6), 1..60)
    ) {
        let temp_dir = TempDir::new().unwrap();
        let packages: Vec<String> = (0..6).map(|i| format!("pkg{}", i)).collect();
        let input = write_plan(&temp_dir, &packages);
        let workspace = Workspace::initialize(&input, &temp_dir.path().join("workspaces")).unwrap();
        let ids: Vec<String> = packages.iter().map(|p| task_id(p)).collect();

        for op in &ops {
            // Transitions that do not apply to the current state are refused,
            // which must leave the workspace untouched as well
            let _ = match op {
                TaskOperation::Done(i) => workspace.mark_done(&ids[*i]),
                TaskOperation::Error(i) => workspace.mark_error(&ids[*i]),
                TaskOperation::Retry(i) => workspace.mark_retry(&ids[*i]),
                TaskOperation::RetryAll => workspace.retry_all_failed().map(|_| ()),
            };
            assert_single_membership(&workspace, &ids);
        }

        info!("Applied {} operations, final status {:?}", ops.len(), workspace.status().unwrap());
    }

    #[test]
    fn prop_done_tasks_never_come_back(
        ops in prop::collection::vec(operation_strategy(4), 1..40)
    ) {
        let temp_dir = TempDir::new().unwrap();
        let packages: Vec<String> = (0..4).map(|i| format!("lib{}", i)).collect();
        let input = write_plan(&temp_dir, &packages);
        let workspace = Workspace::initialize(&input, &temp_dir.path().join("workspaces")).unwrap();
        let ids: Vec<String> = packages.iter().map(|p| task_id(p)).collect();

        let mut done = BTreeSet::new();
        for op in &ops {
            let _ = match op {
                TaskOperation::Done(i) => workspace.mark_done(&ids[*i]),
                TaskOperation::Error(i) => workspace.mark_error(&ids[*i]),
                TaskOperation::Retry(i) => workspace.mark_retry(&ids[*i]),
                TaskOperation::RetryAll => workspace.retry_all_failed().map(|_| ()),
            };
            for id in &ids {
                if workspace.state_of(id) == Some(TaskState::Done) {
                    done.insert(id.clone());
                }
            }
            for id in &done {
                prop_assert_eq!(workspace.state_of(id), Some(TaskState::Done));
            }
        }
    }

    #[test]
    fn prop_restrictions_parse_in_any_order(
        upstream in restriction_strategy(),
        publish in restriction_strategy(),
        upstream_first in any::<bool>()
    ) {
        let text = if upstream_first {
            format!("upstream={},publish={}", upstream, publish)
        } else {
            format!("publish={},upstream={}", publish, upstream)
        };
        let parsed = parse_restrictions(&text).unwrap();
        prop_assert_eq!(parsed, Restrictions { upstream, publish });
    }

    #[test]
    fn prop_identity_depends_only_on_content(
        content in prop::collection::vec(any::<u8>(), 0..512)
    ) {
        let temp_dir = TempDir::new().unwrap();
        let a = temp_dir.path().join("a.csv");
        let b = temp_dir.path().join("nested-b.csv");
        fs::write(&a, &content).unwrap();
        fs::write(&b, &content).unwrap();

        let from_a = ContentIdentity::from_file(&a).unwrap();
        prop_assert_eq!(&from_a, &ContentIdentity::from_file(&b).unwrap());
        prop_assert_eq!(from_a, ContentIdentity::from_bytes(&content));
    }
}
