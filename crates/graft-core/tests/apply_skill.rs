//! Integration tests for the apply pipeline.

mod support;

use graft_core::backup::{backup_pending, clear_backup, restore_backup};
use graft_core::commands::{ApplyCommand, CustomizeSession};
use graft_core::error::EngineError;
use graft_core::fs::sha256_file;

use support::{SkillFixture, TestProject, basic_manifest};

#[test]
fn apply_merges_disjoint_edits_cleanly() {
    let project = TestProject::new();
    project.write_file("src/app.ts", "x=1\ny=2\n");
    project.write_base_file("src/app.ts", "x=1\ny=2\n");
    // User prepended a line after the base snapshot
    project.write_file("src/app.ts", "w=0\nx=1\ny=2\n");

    let skill = SkillFixture::new(
        "skill: appender\nversion: 1.0.0\ncore_version: 1.2.0\nadds: []\nmodifies:\n  - src/app.ts\n",
    )
    .with_modify("src/app.ts", "x=1\ny=2\nz=3\n");
    let skill_dir = project.install_skill_package("appender", &skill);

    let report = ApplyCommand::new(&project.ctx())
        .execute(&skill_dir)
        .expect("apply should succeed");

    assert!(report.applied);
    assert!(report.merge_conflicts.is_empty());
    assert_eq!(report.untracked_changes, vec!["src/app.ts".to_string()]);
    assert_eq!(project.read_file("src/app.ts"), "w=0\nx=1\ny=2\nz=3\n");

    let state = project.state();
    assert_eq!(state.applied_names(), vec!["appender".to_string()]);
    assert!(!backup_pending(&project.ctx()));
}

#[test]
fn ledger_hashes_match_working_tree_after_apply() {
    let project = TestProject::new();
    let skill = SkillFixture::new(&basic_manifest("telegram"))
        .with_add("src/telegram.ts", "export const telegram = true;\n")
        .with_modify("src/config.ts", "export const config = { telegram: true };\n");
    let skill_dir = project.install_skill_package("telegram", &skill);

    ApplyCommand::new(&project.ctx())
        .execute(&skill_dir)
        .expect("apply should succeed");

    let state = project.state();
    let entry = state.applied_skill("telegram").expect("ledger entry");
    for (rel_path, recorded) in &entry.file_hashes {
        let live = sha256_file(&project.root().join(rel_path)).expect("hash should succeed");
        assert_eq!(&live, recorded, "stale hash for {rel_path}");
    }
    assert!(entry.file_hashes.contains_key("src/telegram.ts"));
    assert!(entry.file_hashes.contains_key("src/config.ts"));
}

#[test]
fn conflicting_apply_preserves_backup_for_resolution() {
    let project = TestProject::new();
    project.write_base_file("src/note.txt", "a\n");
    project.write_file("src/note.txt", "a-user\n");

    let skill = SkillFixture::new(
        "skill: noter\nversion: 1.0.0\ncore_version: 1.2.0\nadds: []\nmodifies:\n  - src/note.txt\n",
    )
    .with_modify("src/note.txt", "a-skill\n");
    let skill_dir = project.install_skill_package("noter", &skill);

    let report = ApplyCommand::new(&project.ctx())
        .execute(&skill_dir)
        .expect("conflicted apply still returns a report");

    assert!(!report.applied);
    assert!(report.backup_pending);
    assert_eq!(report.merge_conflicts, vec!["src/note.txt".to_string()]);
    assert_eq!(report.untracked_changes, vec!["src/note.txt".to_string()]);

    let conflicted = project.read_file("src/note.txt");
    assert!(conflicted.contains("<<<<<<<"));
    assert!(conflicted.contains("======="));
    assert!(conflicted.contains(">>>>>>>"));
    assert!(backup_pending(&project.ctx()));

    // Skill not recorded while the conflict is pending
    assert!(project.state().applied_skill("noter").is_none());

    // Aborting restores the pre-apply bytes
    restore_backup(&project.ctx()).expect("restore should succeed");
    clear_backup(&project.ctx()).expect("clear should succeed");
    assert_eq!(project.read_file("src/note.txt"), "a-user\n");
}

#[test]
fn missing_dependency_refused_before_touching_tree() {
    let project = TestProject::new();
    let original = project.read_file("src/config.ts");

    let skill = SkillFixture::new(&format!("{}depends:\n  - base-skill\n", basic_manifest("dependent")))
        .with_add("src/dependent.ts", "x\n")
        .with_modify("src/config.ts", "changed\n");
    let skill_dir = project.install_skill_package("dependent", &skill);

    let err = ApplyCommand::new(&project.ctx())
        .execute(&skill_dir)
        .expect_err("missing dependency must refuse");
    assert!(matches!(
        err.downcast_ref::<EngineError>(),
        Some(EngineError::Precondition(_))
    ));
    assert_eq!(project.read_file("src/config.ts"), original);
    assert!(!project.file_exists("src/dependent.ts"));
}

#[test]
fn conflicting_skill_refused() {
    let project = TestProject::new();
    let first = SkillFixture::new(&basic_manifest("alpha"))
        .with_add("src/alpha.ts", "alpha\n")
        .with_modify("src/config.ts", "export const config = { alpha: true };\n");
    let first_dir = project.install_skill_package("alpha", &first);
    ApplyCommand::new(&project.ctx())
        .execute(&first_dir)
        .expect("first apply should succeed");

    let rival = SkillFixture::new(&format!("{}conflicts:\n  - alpha\n", basic_manifest("rival")))
        .with_add("src/rival.ts", "rival\n")
        .with_modify("src/config.ts", "export const config = { rival: true };\n");
    let rival_dir = project.install_skill_package("rival", &rival);

    let err = ApplyCommand::new(&project.ctx())
        .execute(&rival_dir)
        .expect_err("conflicting skill must refuse");
    assert!(matches!(
        err.downcast_ref::<EngineError>(),
        Some(EngineError::Precondition(_))
    ));
}

#[test]
fn traversal_path_fails_before_touching_tree() {
    let project = TestProject::new();
    let skill = SkillFixture::new(
        "skill: escape\nversion: 1.0.0\ncore_version: 1.2.0\nadds:\n  - ../outside.ts\nmodifies: []\n",
    );
    let skill_dir = project.install_skill_package("escape", &skill);

    let err = ApplyCommand::new(&project.ctx())
        .execute(&skill_dir)
        .expect_err("traversal must be rejected");
    assert!(err.downcast_ref::<EngineError>().is_some());
    assert!(!project.root().parent().expect("parent exists").join("outside.ts").exists());
}

#[test]
fn active_customize_session_blocks_apply() {
    let project = TestProject::new();
    let skill = SkillFixture::new(&basic_manifest("telegram"))
        .with_add("src/telegram.ts", "t\n")
        .with_modify("src/config.ts", "c\n");
    let skill_dir = project.install_skill_package("telegram", &skill);

    CustomizeSession::new(&project.ctx())
        .start("tweak things")
        .expect("session should start");

    let err = ApplyCommand::new(&project.ctx())
        .execute(&skill_dir)
        .expect_err("active session must block apply");
    assert!(matches!(
        err.downcast_ref::<EngineError>(),
        Some(EngineError::Precondition(_))
    ));
}

#[test]
fn failing_test_rolls_back_files_and_ledger() {
    let project = TestProject::new();
    let original_config = project.read_file("src/config.ts");

    let skill = SkillFixture::new(&format!("{}test: \"false\"\n", basic_manifest("flaky")))
        .with_add("src/flaky.ts", "flaky\n")
        .with_modify("src/config.ts", "export const config = { flaky: true };\n");
    let skill_dir = project.install_skill_package("flaky", &skill);

    let err = ApplyCommand::new(&project.ctx())
        .execute(&skill_dir)
        .expect_err("failing test must fail the apply");
    assert!(err.to_string().contains("flaky"));

    assert_eq!(project.read_file("src/config.ts"), original_config);
    assert!(!project.file_exists("src/flaky.ts"), "added file must be removed");
    assert!(project.state().applied_skill("flaky").is_none());
    assert!(!backup_pending(&project.ctx()));
}

#[test]
fn failing_post_apply_rolls_back() {
    let project = TestProject::new();
    let original_config = project.read_file("src/config.ts");

    let skill = SkillFixture::new(&format!(
        "{}post_apply:\n  - \"true\"\n  - \"exit 7\"\n",
        basic_manifest("hooked")
    ))
    .with_add("src/hooked.ts", "hooked\n")
    .with_modify("src/config.ts", "export const config = { hooked: true };\n");
    let skill_dir = project.install_skill_package("hooked", &skill);

    let err = ApplyCommand::new(&project.ctx())
        .execute(&skill_dir)
        .expect_err("failing post_apply must fail the apply");
    assert!(matches!(
        err.downcast_ref::<EngineError>(),
        Some(EngineError::Subprocess { .. })
    ));

    assert_eq!(project.read_file("src/config.ts"), original_config);
    assert!(!project.file_exists("src/hooked.ts"));
    assert!(project.state().applied_skill("hooked").is_none());
}

#[test]
fn file_ops_run_before_adds() {
    let project = TestProject::new();
    project.write_file("src/legacy.ts", "legacy\n");

    let skill = SkillFixture::new(&format!(
        "{}file_ops:\n  - type: rename\n    from: src/legacy.ts\n    to: src/renamed.ts\n",
        basic_manifest("mover")
    ))
    .with_add("src/mover.ts", "mover\n")
    .with_modify("src/config.ts", "export const config = { mover: true };\n");
    let skill_dir = project.install_skill_package("mover", &skill);

    let report = ApplyCommand::new(&project.ctx())
        .execute(&skill_dir)
        .expect("apply should succeed");
    assert!(report.applied);
    assert!(project.file_exists("src/renamed.ts"));
    assert!(!project.file_exists("src/legacy.ts"));
}

#[test]
fn reapplying_replaces_ledger_entry() {
    let project = TestProject::new();
    let skill = SkillFixture::new(&basic_manifest("telegram"))
        .with_add("src/telegram.ts", "v1\n")
        .with_modify("src/config.ts", "export const config = { telegram: 1 };\n");
    let skill_dir = project.install_skill_package("telegram", &skill);

    ApplyCommand::new(&project.ctx())
        .execute(&skill_dir)
        .expect("first apply should succeed");
    ApplyCommand::new(&project.ctx())
        .execute(&skill_dir)
        .expect("re-apply should succeed");

    let state = project.state();
    assert_eq!(
        state
            .applied_skills
            .iter()
            .filter(|s| s.name == "telegram")
            .count(),
        1
    );
}
