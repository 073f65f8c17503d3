pub mod assessments;
pub mod core;
pub mod criteria;
pub mod extensions;
pub mod files;
pub mod results;
pub mod roster;
pub mod schemes;
pub mod summaries;
