pub mod app_config;
pub mod database;
pub mod events;
pub mod memory;
pub mod postgres;

pub use app_config::Config;
pub use database::DbClient;
pub use events::{EventProducer, KafkaNotifier};
pub use memory::MemoryStore;
pub use postgres::PgStockStore;
