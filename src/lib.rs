//! Well cost control: AFE lifecycle, approval routing, cost postings, partner
//! billing and cash-flow economics over a sled store.
pub mod afe;
pub mod approval;
pub mod config;
pub mod context;
pub mod economics;
pub mod error;
pub mod interest;
pub mod metrics;
pub mod service;
pub mod store;
pub mod utils;

pub use config::EngineConfig;
pub use context::{ActionContext, Actor, TimeStamp};
pub use error::{Error, ErrorKind};
pub use service::WellCostService;
