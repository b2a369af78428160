pub mod model;
pub mod plr;

pub use model::{key_code, FileModel, LearnedIndexRegistry, ModelRegistry};
pub use plr::{GreedyPlr, PlrModel, Point, Segment};
