//! The device's own wireless link: station association and the fallback
//! access point.

#[cfg(any(test, feature = "mock"))]
pub mod mock;
pub mod wpa_cli;

#[cfg(any(test, feature = "mock"))]
pub use mock::MockLink;
pub use wpa_cli::WpaCliLink;
