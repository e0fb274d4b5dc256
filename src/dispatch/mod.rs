//! Reply shaping, splitting, and paced delivery

pub mod chunking;
mod pacer;
mod planner;
mod stream;
pub mod text;

pub use pacer::{Pacer, PartialDelivery};
pub use planner::{Chunk, DispatchPlanner, ReplyPlan, random_between};
pub use stream::StreamChunker;
pub use text::{shape_body, shape_reply};
