pub mod sqlite;

pub use sqlite::{RunResult, SqliteLoader};
