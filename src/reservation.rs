//! Network reservations.
//!
//! A reservation binds an instance, a network and optionally an IP
//! address.  Two flavours exist:
//!
//! * [`ExistingReservation`] is observed on an instance that is already
//!   running.  Its type is unknown until the allocator classifies the
//!   address against a pool, and that classification may be rewritten.
//! * [`DesiredReservation`] is requested for the target state.  Its type
//!   is fixed when it is created and can only be confirmed afterwards.
//!
//! Addresses are always held in their integer encoding (see [`crate::ip`]).

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::{IpError, ReservationError};
use crate::ip::{format_ip, ip_to_int};
use crate::types::{Instance, Network};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReservationType {
    Static,
    Dynamic,
}

impl fmt::Display for ReservationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReservationType::Static => f.write_str("static"),
            ReservationType::Dynamic => f.write_str("dynamic"),
        }
    }
}

/// Read accessors and the reserved flag shared by both reservation kinds.
pub trait NetworkReservation: fmt::Display {
    fn instance(&self) -> &Arc<Instance>;

    fn network(&self) -> &Arc<Network>;

    /// Integer encoded address, if one has been assigned.
    fn ip(&self) -> Option<u128>;

    /// `None` only for an existing reservation that has not been classified.
    fn reservation_type(&self) -> Option<ReservationType>;

    fn is_reserved(&self) -> bool;

    /// Records that an allocator committed this reservation.  There is no
    /// way back to unreserved.
    fn mark_reserved(&mut self);

    /// Short human description used in allocator error messages.
    fn describe(&self) -> String;

    fn is_static(&self) -> bool {
        self.reservation_type() == Some(ReservationType::Static)
    }

    fn is_dynamic(&self) -> bool {
        self.reservation_type() == Some(ReservationType::Dynamic)
    }

    fn formatted_ip(&self) -> Option<String> {
        self.ip().map(format_ip)
    }
}

#[derive(Debug, Clone)]
struct Binding {
    instance: Arc<Instance>,
    network: Arc<Network>,
    ip: Option<u128>,
    reserved: bool,
}

impl Binding {
    fn new(
        instance: Arc<Instance>,
        network: Arc<Network>,
        ip: Option<&str>,
    ) -> Result<Self, IpError> {
        Ok(Self {
            instance,
            network,
            ip: ip.map(ip_to_int).transpose()?,
            reserved: false,
        })
    }

    fn ip_or_empty(&self) -> String {
        self.ip.map(format_ip).unwrap_or_default()
    }
}

/// Reservation observed on an already provisioned instance.
#[derive(Debug, Clone)]
pub struct ExistingReservation {
    binding: Binding,
    reservation_type: Option<ReservationType>,
}

impl ExistingReservation {
    pub fn new(
        instance: Arc<Instance>,
        network: Arc<Network>,
        ip: Option<&str>,
    ) -> Result<Self, IpError> {
        Ok(Self {
            binding: Binding::new(instance, network, ip)?,
            reservation_type: None,
        })
    }

    /// Classifies the address.  Always overwrites any earlier
    /// classification.
    pub fn resolve_type(&mut self, reservation_type: ReservationType) {
        self.reservation_type = Some(reservation_type);
    }
}

impl NetworkReservation for ExistingReservation {
    fn instance(&self) -> &Arc<Instance> {
        &self.binding.instance
    }

    fn network(&self) -> &Arc<Network> {
        &self.binding.network
    }

    fn ip(&self) -> Option<u128> {
        self.binding.ip
    }

    fn reservation_type(&self) -> Option<ReservationType> {
        self.reservation_type
    }

    fn is_reserved(&self) -> bool {
        self.binding.reserved
    }

    fn mark_reserved(&mut self) {
        self.binding.reserved = true;
    }

    fn describe(&self) -> String {
        match self.formatted_ip() {
            Some(ip) => format!("existing reservation with IP '{}'", ip),
            None => "existing reservation".to_string(),
        }
    }
}

impl fmt::Display for ExistingReservation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{{ip={}, network={}, instance={}, reserved={}, type={}}}",
            self.binding.ip_or_empty(),
            self.binding.network.name,
            self.binding.instance,
            self.binding.reserved,
            self.reservation_type
                .map(|t| t.to_string())
                .unwrap_or_default(),
        )
    }
}

/// Reservation requested for the desired deployment state.
///
/// Only built through [`DesiredReservation::new_dynamic`] and
/// [`DesiredReservation::new_static`], so a dynamic reservation never
/// starts with an address and a static one always does.
#[derive(Debug, Clone)]
pub struct DesiredReservation {
    binding: Binding,
    reservation_type: ReservationType,
}

impl DesiredReservation {
    pub fn new_dynamic(instance: Arc<Instance>, network: Arc<Network>) -> Self {
        Self {
            binding: Binding {
                instance,
                network,
                ip: None,
                reserved: false,
            },
            reservation_type: ReservationType::Dynamic,
        }
    }

    pub fn new_static(
        instance: Arc<Instance>,
        network: Arc<Network>,
        ip: &str,
    ) -> Result<Self, IpError> {
        Ok(Self {
            binding: Binding::new(instance, network, Some(ip))?,
            reservation_type: ReservationType::Static,
        })
    }

    pub fn declared_type(&self) -> ReservationType {
        self.reservation_type
    }

    /// Assigns the address picked by the allocator, replacing any previous
    /// one.
    pub fn resolve_ip(&mut self, ip: &str) -> Result<(), IpError> {
        self.binding.ip = Some(ip_to_int(ip)?);
        Ok(())
    }

    /// Confirms that the address belongs to a pool of the declared type.
    pub fn resolve_type(&self, reservation_type: ReservationType) -> Result<(), ReservationError> {
        if reservation_type != self.reservation_type {
            return Err(ReservationError::WrongType {
                ip: self.binding.ip_or_empty(),
                network: self.binding.network.name.clone(),
                declared: self.reservation_type,
            });
        }
        Ok(())
    }
}

impl NetworkReservation for DesiredReservation {
    fn instance(&self) -> &Arc<Instance> {
        &self.binding.instance
    }

    fn network(&self) -> &Arc<Network> {
        &self.binding.network
    }

    fn ip(&self) -> Option<u128> {
        self.binding.ip
    }

    fn reservation_type(&self) -> Option<ReservationType> {
        Some(self.reservation_type)
    }

    fn is_reserved(&self) -> bool {
        self.binding.reserved
    }

    fn mark_reserved(&mut self) {
        self.binding.reserved = true;
    }

    fn describe(&self) -> String {
        format!(
            "{} reservation with IP '{}'",
            self.reservation_type,
            self.binding.ip_or_empty()
        )
    }
}

impl fmt::Display for DesiredReservation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{{type={}, ip={}, network={}, instance={}}}",
            self.reservation_type,
            self.binding.ip_or_empty(),
            self.binding.network.name,
            self.binding.instance,
        )
    }
}

/// Either kind of reservation, for planners that keep them in one list.
#[derive(Debug, Clone)]
pub enum Reservation {
    Existing(ExistingReservation),
    Desired(DesiredReservation),
}

impl Reservation {
    fn inner(&self) -> &dyn NetworkReservation {
        match self {
            Reservation::Existing(r) => r,
            Reservation::Desired(r) => r,
        }
    }
}

impl From<ExistingReservation> for Reservation {
    fn from(r: ExistingReservation) -> Self {
        Reservation::Existing(r)
    }
}

impl From<DesiredReservation> for Reservation {
    fn from(r: DesiredReservation) -> Self {
        Reservation::Desired(r)
    }
}

impl NetworkReservation for Reservation {
    fn instance(&self) -> &Arc<Instance> {
        self.inner().instance()
    }

    fn network(&self) -> &Arc<Network> {
        self.inner().network()
    }

    fn ip(&self) -> Option<u128> {
        self.inner().ip()
    }

    fn reservation_type(&self) -> Option<ReservationType> {
        self.inner().reservation_type()
    }

    fn is_reserved(&self) -> bool {
        self.inner().is_reserved()
    }

    fn mark_reserved(&mut self) {
        match self {
            Reservation::Existing(r) => r.mark_reserved(),
            Reservation::Desired(r) => r.mark_reserved(),
        }
    }

    fn describe(&self) -> String {
        self.inner().describe()
    }
}

impl fmt::Display for Reservation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Reservation::Existing(r) => r.fmt(f),
            Reservation::Desired(r) => r.fmt(f),
        }
    }
}
