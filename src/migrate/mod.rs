pub mod cursor;
pub mod engine;
pub mod partition;

pub use cursor::{MigrationCursor, MigrationStatus};
pub use engine::{MigrationEngine, MigrationOptions, MigrationProgress, MigrationReport};
pub use partition::Partition;
