pub mod async_stage;
pub mod emitter;
pub mod pipeline;
pub mod stage;
pub mod sync_stage;

pub use crate::domain::model::{Output, Record, StageSummary};
pub use crate::domain::ports::{ErrorChannel, Stage};
pub use crate::utils::error::Result;
