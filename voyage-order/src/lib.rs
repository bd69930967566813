pub mod cart;
pub mod lifecycle;
pub mod maintenance;
pub mod service;

pub use cart::CartService;
pub use lifecycle::{transition, OrderAction, OrderEffect, Transition};
pub use maintenance::{cleanup_idempotency, Maintenance, MaintenanceReport};
pub use service::OrderService;
