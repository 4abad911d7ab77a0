// API crate clippy configuration
#![cfg_attr(test, allow(clippy::expect_used))]
#![cfg_attr(test, allow(clippy::unwrap_used))]

//! Shopfront API Library
//!
//! HTTP surface over the billing reconciliation engine: the Stripe webhook
//! endpoint, checkout session creation and the entitlement gate.

pub mod error;
pub mod routes;
pub mod state;

pub use error::{ApiError, ApiResult};
pub use routes::create_router;
pub use state::AppState;
