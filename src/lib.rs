// All API endpoints must be async
#[allow(clippy::unused_async)]
// We expect request users and servers (probably shouldn't tho)
#[allow(clippy::missing_panics_doc)]
#[cfg(feature = "meowlnir_bin")]
pub mod api;
pub mod clap;
pub mod config;
pub mod db;
pub mod homeserver;
// `self` is required for easy access to methods
#[allow(clippy::unused_self)]
pub mod service;
pub mod utils;

// Not async due to services() being used in many closures, and async closures are not stable as of writing
use std::sync::RwLock;

pub use config::Config;
pub use service::Services;
pub use utils::error::{Error, Result};

pub static SERVICES: RwLock<Option<&'static Services>> = RwLock::new(None);

pub fn services() -> &'static Services {
    SERVICES
        .read()
        .unwrap()
        .expect("SERVICES should be initialized when this is called")
}
