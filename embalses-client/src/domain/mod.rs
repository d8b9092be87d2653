pub mod observation;
pub mod raw_record;
pub mod reservoir;
pub mod run_meta;

pub use observation::Observation;
pub use raw_record::RawRecord;
pub use reservoir::{Reservoir, ReservoirDetail, ReservoirSnapshot};
pub use run_meta::{NationalSummary, RunMeta};
