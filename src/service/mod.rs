pub mod alerts;
pub mod bridge;
pub mod coordinator;
pub mod notify;
pub mod worker_pool;
