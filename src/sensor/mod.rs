pub mod als;
pub mod lux;

pub use als::{AlsSensor, LightSensor};
pub use lux::LuxSmoother;

#[cfg(test)]
pub use als::FakeAls;
