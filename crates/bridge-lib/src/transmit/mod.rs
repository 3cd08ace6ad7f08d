//! Delivery of encoded readings to the remote collector

mod dispatcher;
mod link;

pub use dispatcher::{
    ConnectivityState, DeliveryOutcome, DispatcherConfig, LinkState, NetworkMetrics,
    TransmitDispatcher, TransmitError,
};
pub use link::{Link, ManualLink, TcpLink};
