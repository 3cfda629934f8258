//! Main test module for origin-control
//!
//! This module includes all test suites:
//! - Integration tests for complete runs
//! - Chaos tests for failing, stalling and interrupted registries
//! - Property-based tests for workspace invariants

pub mod integration;
pub mod property;

#[cfg(test)]
mod edge_cases {
    use ::origin_control::registry::{RegistryState, StoredPackage, StoredRepository};
    use ::origin_control::*;
    use std::fs;
    use std::sync::Arc;
    use tempfile::TempDir;

    use crate::integration::{write_input, HEADER};

    fn config(temp_dir: &TempDir) -> ToolkitConfig {
        ToolkitConfig {
            workspaces_home: temp_dir.path().join("workspaces"),
            backups_home: temp_dir.path().join("backups"),
            workers: 2,
            ..Default::default()
        }
    }

    #[test]
    fn test_header_only_input() {
        let temp_dir = TempDir::new().unwrap();
        let input = temp_dir.path().join("empty.csv");
        write_input(&input, &[]);
        let registry = Arc::new(FileRegistry::in_memory(RegistryState::new("corp")));

        let outcome = ApplyRunBuilder::new("corp", "internal", &input)
            .config(config(&temp_dir))
            .client(registry)
            .build()
            .unwrap()
            .execute()
            .unwrap();
        match outcome {
            ApplyOutcome::Completed(summary) => {
                assert_eq!(summary.report.processed(), 0);
                assert_eq!(summary.report.summary(), "Processed 0 tasks (0 successes, 0 failures)");
                assert_eq!(summary.backup.map(|(_, rows)| rows), Some(0));
            }
            other => panic!("unexpected outcome {:?}", other),
        }
    }

    #[test]
    fn test_missing_header_is_line_one() {
        let temp_dir = TempDir::new().unwrap();
        let input = temp_dir.path().join("plan.csv");
        fs::write(&input, "corp,internal,npm,,a,BLOCK,ALLOW\n").unwrap();

        let err = ApplyRunBuilder::new("corp", "internal", &input)
            .mode(ApplyMode::ValidateOnly)
            .build()
            .unwrap()
            .execute()
            .unwrap_err();
        assert!(matches!(err, OriginError::Validation { line: 1, .. }));
    }

    #[test]
    fn test_scoped_unicode_and_quoted_names() {
        let temp_dir = TempDir::new().unwrap();
        let names = [("@types", "node"), ("", "pâté"), ("", "has,comma"), ("org.acme", "core-lib")];

        let mut content = format!("{}\n", HEADER);
        let mut stored = Vec::new();
        for (namespace, package) in names {
            let mut writer = csv::Writer::from_writer(Vec::new());
            writer
                .write_record(["corp", "internal", "npm", namespace, package, "BLOCK", "BLOCK"])
                .unwrap();
            content.push_str(&String::from_utf8(writer.into_inner().unwrap()).unwrap());
            stored.push(StoredPackage {
                format: "npm".to_string(),
                namespace: namespace.to_string(),
                package: package.to_string(),
                restrictions: Restrictions::ALLOW_ALL,
            });
        }
        let input = temp_dir.path().join("plan.csv");
        fs::write(&input, content).unwrap();
        let registry = Arc::new(FileRegistry::in_memory(RegistryState::new("corp").with_repository(
            "internal",
            StoredRepository {
                packages: stored,
                ..Default::default()
            },
        )));

        let outcome = ApplyRunBuilder::new("corp", "internal", &input)
            .config(config(&temp_dir))
            .client(registry.clone())
            .build()
            .unwrap()
            .execute()
            .unwrap();
        match outcome {
            ApplyOutcome::Completed(summary) => {
                assert_eq!(summary.report.succeeded, names.len());
                assert!(summary.workspace_deleted);
            }
            other => panic!("unexpected outcome {:?}", other),
        }

        let blocked = Restrictions {
            upstream: Restriction::Block,
            publish: Restriction::Block,
        };
        for package in registry.snapshot().repositories["internal"].packages.iter() {
            assert_eq!(package.restrictions, blocked, "{}", package.package);
        }
    }

    #[test]
    fn test_identical_content_shares_a_workspace() -> anyhow::Result<()> {
        let temp_dir = TempDir::new()?;
        let home = temp_dir.path().join("workspaces");
        let rows = vec!["corp,internal,npm,,a,BLOCK,ALLOW".to_string()];
        let first = temp_dir.path().join("first.csv");
        let second = temp_dir.path().join("copy-of-first.csv");
        write_input(&first, &rows);
        write_input(&second, &rows);

        let a = Workspace::initialize(&first, &home)?;
        a.mark_done("corp-internal-npm--a")?;
        let b = Workspace::initialize(&second, &home)?;

        assert_eq!(a.root(), b.root());
        assert_eq!(a.identity(), b.identity());
        // Same data set, so the finished task is not handed out again
        assert_eq!(b.tasks()?.len(), 0);
        assert!(b.is_clean()?);
        Ok(())
    }

    #[test]
    fn test_duplicate_rows() {
        let temp_dir = TempDir::new().unwrap();
        let input = temp_dir.path().join("plan.csv");
        write_input(
            &input,
            &[
                "corp,internal,npm,,a,BLOCK,ALLOW".to_string(),
                "corp,internal,npm,,a,ALLOW,ALLOW".to_string(),
            ],
        );

        let err = Workspace::initialize(&input, &temp_dir.path().join("strict")).unwrap_err();
        assert!(matches!(err, OriginError::DuplicateTask { line: 3, .. }));

        let workspace = Workspace::initialize_with(
            &input,
            &temp_dir.path().join("lenient"),
            DuplicatePolicy::LastWriteWins,
        )
        .unwrap();
        let record = workspace.read_task("corp-internal-npm--a").unwrap();
        assert_eq!(record.restrictions(), Restrictions::ALLOW_ALL);
    }

    #[test]
    fn test_registry_state_file_survives_a_run() -> anyhow::Result<()> {
        let temp_dir = TempDir::new()?;
        let state_path = temp_dir.path().join("registry.json");
        let state = RegistryState::new("corp").with_repository(
            "internal",
            StoredRepository {
                packages: vec![StoredPackage {
                    format: "npm".to_string(),
                    namespace: String::new(),
                    package: "a".to_string(),
                    restrictions: Restrictions::ALLOW_ALL,
                }],
                ..Default::default()
            },
        );
        fs::write(&state_path, serde_json::to_string_pretty(&state)?)?;

        let input = temp_dir.path().join("plan.csv");
        write_input(&input, &["corp,internal,npm,,a,BLOCK,ALLOW".to_string()]);
        let registry = Arc::new(FileRegistry::open(&state_path)?);
        ApplyRunBuilder::new("corp", "internal", &input)
            .config(config(&temp_dir))
            .client(registry)
            .build()?
            .execute()?;

        let reloaded = FileRegistry::open(&state_path)?;
        let key = PackageKey {
            domain: "corp".to_string(),
            repository: "internal".to_string(),
            format: "npm".to_string(),
            namespace: String::new(),
            package: "a".to_string(),
        };
        assert_eq!(reloaded.describe_restrictions(&key)?, Restrictions::UPSTREAM_BLOCKED);
        Ok(())
    }
}
