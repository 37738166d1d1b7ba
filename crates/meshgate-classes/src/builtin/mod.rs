//! Built-in command classes.

mod association;
mod configuration;
mod notification;
mod sensor;
mod switch;
mod wakeup;

use std::sync::Arc;

use crate::class::CommandClass;

pub use association::Association;
pub use configuration::Configuration;
pub use notification::Notification;
pub use sensor::{BinarySensor, MultilevelSensor};
pub use switch::{BinarySwitch, MultilevelSwitch};
pub use wakeup::{WakeUp, MAX_WAKEUP_INTERVAL};

/// Every built-in class.
pub fn all() -> Vec<Arc<dyn CommandClass>> {
    vec![
        Arc::new(BinarySwitch),
        Arc::new(MultilevelSwitch),
        Arc::new(BinarySensor),
        Arc::new(MultilevelSensor),
        Arc::new(Configuration),
        Arc::new(Notification),
        Arc::new(WakeUp),
        Arc::new(Association),
    ]
}
