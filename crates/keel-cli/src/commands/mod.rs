pub mod change;
pub mod common;
pub mod conflicts;
pub mod device;
pub mod entity;
pub mod purge;
pub mod remote;
pub mod sync;
