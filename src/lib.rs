pub mod auth;
pub mod limits;
pub mod model;
pub mod notify;
pub mod observability;
pub mod reaper;
pub mod scheduler;
pub mod school;
pub mod slots;
pub mod sql;
pub mod tls;
pub mod wal;
pub mod wire;
