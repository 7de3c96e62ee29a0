//! Engine operations: the apply/uninstall/replay pipeline and the
//! rebase/update/customize state machines.

pub mod apply;
pub mod customize;
pub mod init;
pub mod rebase;
pub mod replay;
pub mod uninstall;
pub mod update;

pub use apply::{ApplyCommand, ApplyReport};
pub use customize::{CustomizeSession, CustomizeCommit};
pub use init::{InitCommand, MigrateReport};
pub use rebase::{RebaseCommand, RebaseReport};
pub use replay::{ReplayReport, StructuredAggregate, find_skill_dir, replay_skills};
pub use uninstall::{UninstallCommand, UninstallReport};
pub use update::{UpdateCommand, UpdatePreview, UpdateReport};
