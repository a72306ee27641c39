pub mod ctx;
pub mod ids;
pub mod record;

pub use ctx::Ctx;
pub use ids::{JobId, UnitId};
pub use record::{JobRecord, JobRecordStatus};
