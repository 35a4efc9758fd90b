//! Application Services
//!
//! - `Broker`: routes subscriptions to tailers and fans out their lines

mod broker;

pub use broker::{Broker, BrokerConfig, BrokerError, BrokerStats, TailerStatus};
