//! Integration tests for core updates.

mod support;

use std::fs;
use std::path::PathBuf;

use graft_core::commands::{ApplyCommand, CustomizeSession, UpdateCommand};
use graft_core::error::EngineError;

use support::{SkillFixture, TestProject, basic_manifest, write};

/// Build a new-core directory derived from the project's base snapshot.
fn new_core_from_base(project: &TestProject, version: &str) -> PathBuf {
    let new_core = project
        .root()
        .parent()
        .expect("parent exists")
        .join("new-core");
    graft_core::fs::copy_dir(&project.ctx().base_dir(), &new_core)
        .expect("copy base should succeed");
    write(
        &new_core.join("package.json"),
        &format!("{{\n  \"name\": \"core\",\n  \"version\": \"{version}\",\n  \"dependencies\": {{}}\n}}\n"),
    );
    new_core
}

#[test]
fn preview_reports_changes_deletions_and_risk() {
    let project = TestProject::new();

    let base = "line1\nline2\nline3\nline4\nline5\nline6\n";
    project.write_file("src/config.ts", base);
    project.write_base_file("src/config.ts", base);
    project.write_file("src/util.ts", "old util\n");
    project.write_base_file("src/util.ts", "old util\n");

    let skill = SkillFixture::new(&basic_manifest("telegram"))
        .with_add("src/telegram.ts", "t\n")
        .with_modify(
            "src/config.ts",
            "line1\nline2\nline3\nline4\nline5\nline6\ntelegram: on\n",
        );
    let skill_dir = project.install_skill_package("telegram", &skill);
    ApplyCommand::new(&project.ctx())
        .execute(&skill_dir)
        .expect("apply should succeed");

    let new_core = new_core_from_base(&project, "1.3.0");
    // The new core rewrites config.ts and drops util.ts
    write(
        &new_core.join("src/config.ts"),
        "line0\nline1\nline2\nline3\nline4\nline5\nline6\n",
    );
    fs::remove_file(new_core.join("src/util.ts")).expect("remove should succeed");

    let preview = UpdateCommand::new(&project.ctx())
        .preview(&new_core)
        .expect("preview should succeed");

    assert_eq!(preview.current_version, "1.2.0");
    assert_eq!(preview.new_version, "1.3.0");
    assert!(preview.files_changed.contains(&"src/config.ts".to_string()));
    assert!(preview.files_deleted.contains(&"src/util.ts".to_string()));
    // config.ts is skill-managed, so it carries conflict risk
    assert!(preview.conflict_risk.contains(&"src/config.ts".to_string()));
}

#[test]
fn update_merges_core_change_under_skill_overlay() {
    let project = TestProject::new();

    let base = "line1\nline2\nline3\nline4\nline5\nline6\n";
    project.write_file("src/config.ts", base);
    project.write_base_file("src/config.ts", base);

    let skill = SkillFixture::new(&basic_manifest("telegram"))
        .with_add("src/telegram.ts", "t\n")
        .with_modify(
            "src/config.ts",
            "line1\nline2\nline3\nline4\nline5\nline6\ntelegram: on\n",
        );
    let skill_dir = project.install_skill_package("telegram", &skill);
    ApplyCommand::new(&project.ctx())
        .execute(&skill_dir)
        .expect("apply should succeed");

    let new_core = new_core_from_base(&project, "1.3.0");
    write(
        &new_core.join("src/config.ts"),
        "line0\nline1\nline2\nline3\nline4\nline5\nline6\n",
    );

    let report = UpdateCommand::new(&project.ctx())
        .execute(&new_core)
        .expect("update should succeed");
    assert!(report.updated);
    assert_eq!(report.previous_version, "1.2.0");
    assert_eq!(report.new_version, "1.3.0");

    // Core edit and skill overlay both survive the merge
    let config = project.read_file("src/config.ts");
    assert!(config.starts_with("line0\n"));
    assert!(config.contains("telegram: on"));

    // The base is now the new core, and the ledger tracks the new version
    let base_config = fs::read_to_string(project.ctx().base_dir().join("src/config.ts"))
        .expect("base config should exist");
    assert!(base_config.starts_with("line0\n"));
    assert!(!base_config.contains("telegram: on"));
    assert_eq!(project.state().core_version, "1.3.0");
    assert!(!project.ctx().backup_dir().exists());
}

#[test]
fn update_deletes_files_dropped_by_new_core() {
    let project = TestProject::new();
    project.write_file("src/util.ts", "old util\n");
    project.write_base_file("src/util.ts", "old util\n");

    let skill = SkillFixture::new(&basic_manifest("telegram"))
        .with_add("src/telegram.ts", "t\n")
        .with_modify("src/config.ts", "export const config = { telegram: true };\n");
    let skill_dir = project.install_skill_package("telegram", &skill);
    ApplyCommand::new(&project.ctx())
        .execute(&skill_dir)
        .expect("apply should succeed");

    let new_core = new_core_from_base(&project, "2.0.0");
    fs::remove_file(new_core.join("src/util.ts")).expect("remove should succeed");

    let report = UpdateCommand::new(&project.ctx())
        .execute(&new_core)
        .expect("update should succeed");
    assert!(report.updated);
    assert!(!project.file_exists("src/util.ts"));
    assert!(!project.ctx().base_dir().join("src/util.ts").exists());
}

#[test]
fn update_blocked_during_customize_session() {
    let project = TestProject::new();
    let skill = SkillFixture::new(&basic_manifest("telegram"))
        .with_add("src/telegram.ts", "t\n")
        .with_modify("src/config.ts", "export const config = { telegram: true };\n");
    let skill_dir = project.install_skill_package("telegram", &skill);
    ApplyCommand::new(&project.ctx())
        .execute(&skill_dir)
        .expect("apply should succeed");

    CustomizeSession::new(&project.ctx())
        .start("mid-flight")
        .expect("start should succeed");

    let new_core = new_core_from_base(&project, "1.3.0");
    let err = UpdateCommand::new(&project.ctx())
        .execute(&new_core)
        .expect_err("active session must block update");
    assert!(matches!(
        err.downcast_ref::<EngineError>(),
        Some(EngineError::Precondition(_))
    ));
}

#[test]
fn update_merges_shipped_path_remap() {
    let project = TestProject::new();
    let skill = SkillFixture::new(&basic_manifest("telegram"))
        .with_add("src/telegram.ts", "t\n")
        .with_modify("src/config.ts", "export const config = { telegram: true };\n");
    let skill_dir = project.install_skill_package("telegram", &skill);
    ApplyCommand::new(&project.ctx())
        .execute(&skill_dir)
        .expect("apply should succeed");

    let new_core = new_core_from_base(&project, "1.4.0");
    write(
        &new_core.join(".g2-meta/path_remap.yaml"),
        "src/config.ts: src/core/config.ts\n",
    );

    UpdateCommand::new(&project.ctx())
        .execute(&new_core)
        .expect("update should succeed");

    let remap = project.ctx().state_store().path_remap().expect("remap should load");
    assert_eq!(remap.resolve("src/config.ts"), "src/core/config.ts");
}
