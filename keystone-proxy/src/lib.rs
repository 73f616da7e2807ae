pub mod proxy;

pub use proxy::{Backend, ProxyPool};
