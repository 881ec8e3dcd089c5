mod digest;
mod gc;
pub mod update;

pub use digest::cmd_digest;
pub use gc::cmd_gc;
pub use update::cmd_update;
