pub mod admin;
pub mod proxy;
pub mod relay_ws;

pub use admin::admin_router;
pub use proxy::proxy_router;
pub use relay_ws::relay_router;
