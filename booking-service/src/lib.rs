pub mod api;
pub mod cache;
pub mod gateway;
pub mod lifecycle;
pub mod lock;
pub mod models;
pub mod queue;
pub mod reservation;
pub mod schema;
pub mod store;
pub mod store_memory;
pub mod store_pg;
pub mod sweeper;
pub mod worker;
