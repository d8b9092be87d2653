pub mod bulletin_archive;
pub mod bulletin_row;
pub mod http_bulletin;

pub use bulletin_archive::{AccessTools, ArchiveFileSource};
pub use http_bulletin::HttpBulletinSource;
