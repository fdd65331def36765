pub mod app_config;
pub mod events;
pub mod memory;
pub mod postgres;

pub use app_config::Config;
pub use events::EventProducer;
pub use memory::{MemoryPublisher, MemoryStore};
pub use postgres::PgStore;
