pub mod blinker;
pub mod driver;
pub mod service;

pub use driver::{init_driver, LedDriver, SimulatedDriver, Ws2812Driver};
pub use service::LedService;
