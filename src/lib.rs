//! Network reservation bookkeeping and fleet-wide agent broadcasts for
//! the deployment director.

pub mod agent;
pub mod broadcast;
pub mod config;
pub mod error;
pub mod inventory;
pub mod ip;
pub mod reservation;
pub mod store;
pub mod types;

pub use broadcast::{AgentBroadcaster, SyncDnsSummary};
pub use reservation::{
    DesiredReservation, ExistingReservation, NetworkReservation, Reservation, ReservationType,
};
