mod classpath;
mod clean_locks;
mod hash;
mod plan;

pub use classpath::cmd_classpath;
pub use clean_locks::cmd_clean_locks;
pub use hash::cmd_hash;
pub use plan::cmd_plan;
