pub mod handlers;
pub mod response;
mod routes;

pub use routes::{capture_panic_backtraces, create_router};
