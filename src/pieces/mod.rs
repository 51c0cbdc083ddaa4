pub mod availability;
pub mod grid;
pub mod priority;

pub use availability::Availability;
pub use grid::{ChunkRange, chunk_of, chunks_for_bytes, range_of};
pub use priority::{PriorityPlan, PriorityScheduler, largest_file, select_target};
