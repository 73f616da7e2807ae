pub mod config;
pub mod error;
pub mod route;
pub mod router;

pub use config::KeystoneConfig;
pub use error::KeystoneError;
pub use route::{RouteEntry, Target, Tenant};
pub use router::TenantRouter;
