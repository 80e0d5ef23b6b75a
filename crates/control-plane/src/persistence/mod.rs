use sqlx::SqlitePool;

pub mod bandwidth;
pub mod credentials;
pub mod devices;
pub mod failover_log;
pub mod health;
pub mod migrations;
pub mod servers;

pub type Db = SqlitePool;

pub use bandwidth::BandwidthDay;
pub use devices::{DeviceRecord, DeviceStatus, NewDevice};
pub use failover_log::{FailoverLogRecord, FailoverStatus};
pub use health::{HealthCheckRecord, UptimeWindow};
pub use migrations::{MigrationLabel, MigrationRunOutcome, MigrationSnapshot};
pub use servers::{AccessLevel, HealthStatus, NewServer, ServerRecord};
