pub mod context;
pub mod relay;
pub mod request;
pub mod router;
pub mod server;
