//! PostgreSQL driver for the tandem job-chain engine.
//!
//! [`PgJobStore`] implements the store contract over sqlx with
//! `FOR UPDATE SKIP LOCKED` acquisition, and [`PgNotifyBus`] carries
//! wake-up topics over LISTEN/NOTIFY. Schema migrations are bundled;
//! run them once at startup.
//!
//! ```ignore
//! let pool = PgPool::connect(&database_url).await?;
//! let store = PgJobStore::new(pool.clone());
//! store.migrate().await?;
//! let bus = PgNotifyBus::connect(pool).await?;
//!
//! let worker = Worker::new(Arc::new(store.clone()), Arc::new(bus), registry).start();
//! ```

mod listener;
mod store;

pub use listener::PgNotifyBus;
pub use store::PgJobStore;
