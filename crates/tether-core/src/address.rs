//! Structured endpoint addresses.
//!
//! Every routable envelope carries a source and destination [`Address`]. An
//! address names a peer by its type and numeric id; a broadcast address
//! instead stores the *target type* in its id field, so
//! `Address::broadcast(AddressType::Host)` reaches every host.
//!
//! On the wire an address is a compact array `[type, id]` or
//! `[type, id, requestId]`.

use serde::de::{self, SeqAccess, Visitor};
use serde::ser::SerializeTuple;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Address parse / construction errors
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AddressError {
    /// Unrecognized shorthand form
    #[error("unrecognized address shorthand: {0}")]
    UnknownShorthand(String),

    /// Type number outside 0-4
    #[error("invalid address type: {0}")]
    InvalidType(u64),

    /// Broadcast address whose id is not a concrete peer type
    #[error("invalid broadcast target type: {0}")]
    InvalidBroadcastTarget(u32),
}

/// Kind of peer an address refers to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u8)]
pub enum AddressType {
    /// The central controller
    Controller = 0,
    /// A game-server instance, reached through its host
    Instance = 1,
    /// A host managing instances
    Host = 2,
    /// An interactive control client
    Control = 3,
    /// All peers of the type stored in the address id
    Broadcast = 4,
}

impl AddressType {
    /// Numeric wire value
    #[must_use]
    pub const fn as_u32(self) -> u32 {
        self as u32
    }

    /// Parse a numeric wire value
    ///
    /// # Errors
    ///
    /// Returns `AddressError::InvalidType` for values outside 0-4.
    pub fn from_u64(value: u64) -> Result<Self, AddressError> {
        match value {
            0 => Ok(AddressType::Controller),
            1 => Ok(AddressType::Instance),
            2 => Ok(AddressType::Host),
            3 => Ok(AddressType::Control),
            4 => Ok(AddressType::Broadcast),
            other => Err(AddressError::InvalidType(other)),
        }
    }

    /// Lowercase peer name as used in `"source-target"` link pairs
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            AddressType::Controller => "controller",
            AddressType::Instance => "instance",
            AddressType::Host => "host",
            AddressType::Control => "control",
            AddressType::Broadcast => "broadcast",
        }
    }
}

impl fmt::Display for AddressType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Immutable endpoint identifier
///
/// Equality is structural over type, id and request id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Address {
    kind: AddressType,
    id: u32,
    request_id: Option<u32>,
}

impl Address {
    /// Create an address from its parts
    #[must_use]
    pub const fn new(kind: AddressType, id: u32) -> Self {
        Self {
            kind,
            id,
            request_id: None,
        }
    }

    /// The controller (there is exactly one, id 0)
    #[must_use]
    pub const fn controller() -> Self {
        Self::new(AddressType::Controller, 0)
    }

    /// A specific host
    #[must_use]
    pub const fn host(id: u32) -> Self {
        Self::new(AddressType::Host, id)
    }

    /// A specific instance
    #[must_use]
    pub const fn instance(id: u32) -> Self {
        Self::new(AddressType::Instance, id)
    }

    /// A specific control client
    #[must_use]
    pub const fn control(id: u32) -> Self {
        Self::new(AddressType::Control, id)
    }

    /// Broadcast to every peer of `target`
    #[must_use]
    pub const fn broadcast(target: AddressType) -> Self {
        Self::new(AddressType::Broadcast, target.as_u32())
    }

    /// Copy of this address tagged with a request id
    #[must_use]
    pub const fn with_request_id(self, request_id: u32) -> Self {
        Self {
            kind: self.kind,
            id: self.id,
            request_id: Some(request_id),
        }
    }

    /// Copy of this address without a request id
    #[must_use]
    pub const fn without_request_id(self) -> Self {
        Self::new(self.kind, self.id)
    }

    /// Address type
    #[must_use]
    pub const fn kind(&self) -> AddressType {
        self.kind
    }

    /// Peer id, or the target type number for broadcasts
    #[must_use]
    pub const fn id(&self) -> u32 {
        self.id
    }

    /// Request id this address is tagged with, if any
    #[must_use]
    pub const fn request_id(&self) -> Option<u32> {
        self.request_id
    }

    /// Returns true for broadcast addresses
    #[must_use]
    pub const fn is_broadcast(&self) -> bool {
        matches!(self.kind, AddressType::Broadcast)
    }

    /// Target type of a broadcast address
    #[must_use]
    pub fn broadcast_target(&self) -> Option<AddressType> {
        if self.is_broadcast() {
            AddressType::from_u64(u64::from(self.id)).ok()
        } else {
            None
        }
    }

    /// Returns true if a message sent to `self` should be delivered to `dst`
    ///
    /// That is the case when both addresses are equal, or when `self` is a
    /// broadcast whose target type is `dst`'s type.
    #[must_use]
    pub fn addressed_to(&self, dst: &Address) -> bool {
        if self == dst {
            return true;
        }
        self.is_broadcast() && self.id == dst.kind.as_u32()
    }

    /// Convert an ergonomic shorthand into a canonical address
    #[must_use]
    pub fn from_shorthand(value: AddressShorthand) -> Self {
        match value {
            AddressShorthand::Controller => Address::controller(),
            AddressShorthand::Host(id) => Address::host(id),
            AddressShorthand::Instance(id) => Address::instance(id),
            AddressShorthand::Control(id) => Address::control(id),
            AddressShorthand::AllHosts => Address::broadcast(AddressType::Host),
            AddressShorthand::AllInstances => Address::broadcast(AddressType::Instance),
            AddressShorthand::AllControls => Address::broadcast(AddressType::Control),
        }
    }

    /// Parse a JSON shorthand: `"controller"`, `"allHosts"`, `"allInstances"`,
    /// `"allControls"`, `{"hostId": n}`, `{"instanceId": n}` or
    /// `{"controlId": n}`
    ///
    /// # Errors
    ///
    /// Returns `AddressError::UnknownShorthand` for anything else.
    pub fn from_shorthand_json(value: &Value) -> Result<Self, AddressError> {
        AddressShorthand::from_json(value).map(Address::from_shorthand)
    }

    fn check(self) -> Result<Self, AddressError> {
        if self.is_broadcast() {
            match AddressType::from_u64(u64::from(self.id)) {
                Ok(AddressType::Broadcast) | Err(_) => {
                    return Err(AddressError::InvalidBroadcastTarget(self.id));
                }
                Ok(_) => {}
            }
        }
        Ok(self)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.broadcast_target(), self.request_id) {
            (Some(target), _) => write!(f, "broadcast:{target}"),
            (None, Some(rid)) => write!(f, "{}:{}#{}", self.kind, self.id, rid),
            (None, None) => write!(f, "{}:{}", self.kind, self.id),
        }
    }
}

/// Ergonomic ways of naming an address
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressShorthand {
    /// `"controller"`
    Controller,
    /// `{hostId}`
    Host(u32),
    /// `{instanceId}`
    Instance(u32),
    /// `{controlId}`
    Control(u32),
    /// `"allHosts"`
    AllHosts,
    /// `"allInstances"`
    AllInstances,
    /// `"allControls"`
    AllControls,
}

impl AddressShorthand {
    /// Parse the JSON form of a shorthand
    ///
    /// # Errors
    ///
    /// Returns `AddressError::UnknownShorthand` on unrecognized input.
    pub fn from_json(value: &Value) -> Result<Self, AddressError> {
        match value {
            Value::String(s) => s.parse(),
            Value::Object(map) if map.len() == 1 => {
                let (key, id) = map.iter().next().ok_or_else(|| unknown(value))?;
                let id = id
                    .as_u64()
                    .and_then(|id| u32::try_from(id).ok())
                    .ok_or_else(|| unknown(value))?;
                match key.as_str() {
                    "hostId" => Ok(AddressShorthand::Host(id)),
                    "instanceId" => Ok(AddressShorthand::Instance(id)),
                    "controlId" => Ok(AddressShorthand::Control(id)),
                    _ => Err(unknown(value)),
                }
            }
            _ => Err(unknown(value)),
        }
    }
}

fn unknown(value: &Value) -> AddressError {
    AddressError::UnknownShorthand(value.to_string())
}

impl FromStr for AddressShorthand {
    type Err = AddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "controller" => Ok(AddressShorthand::Controller),
            "allHosts" => Ok(AddressShorthand::AllHosts),
            "allInstances" => Ok(AddressShorthand::AllInstances),
            "allControls" => Ok(AddressShorthand::AllControls),
            other => Err(AddressError::UnknownShorthand(other.to_string())),
        }
    }
}

impl From<AddressShorthand> for Address {
    fn from(value: AddressShorthand) -> Self {
        Address::from_shorthand(value)
    }
}

impl Serialize for Address {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let len = if self.request_id.is_some() { 3 } else { 2 };
        let mut tuple = serializer.serialize_tuple(len)?;
        tuple.serialize_element(&self.kind.as_u32())?;
        tuple.serialize_element(&self.id)?;
        if let Some(rid) = self.request_id {
            tuple.serialize_element(&rid)?;
        }
        tuple.end()
    }
}

struct AddressVisitor;

impl<'de> Visitor<'de> for AddressVisitor {
    type Value = Address;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("an address array [type, id] or [type, id, requestId]")
    }

    fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<Address, A::Error> {
        let kind: u64 = seq
            .next_element()?
            .ok_or_else(|| de::Error::invalid_length(0, &self))?;
        let id: u32 = seq
            .next_element()?
            .ok_or_else(|| de::Error::invalid_length(1, &self))?;
        let request_id: Option<u32> = seq.next_element()?;
        if seq.next_element::<de::IgnoredAny>()?.is_some() {
            return Err(de::Error::invalid_length(4, &self));
        }

        let kind = AddressType::from_u64(kind).map_err(de::Error::custom)?;
        let address = Address {
            kind,
            id,
            request_id,
        };
        address.check().map_err(de::Error::custom)
    }
}

impl<'de> Deserialize<'de> for Address {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserializer.deserialize_seq(AddressVisitor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_broadcast_matches_type() {
        let all_hosts = Address::broadcast(AddressType::Host);
        assert!(all_hosts.addressed_to(&Address::host(7)));
        assert!(!all_hosts.addressed_to(&Address::instance(7)));
    }

    #[test]
    fn test_distinct_ids_do_not_match() {
        assert!(!Address::host(7).addressed_to(&Address::host(8)));
        assert!(Address::host(7).addressed_to(&Address::host(7)));
    }

    #[test]
    fn test_request_id_is_part_of_equality() {
        let tagged = Address::control(3).with_request_id(9);
        assert_ne!(tagged, Address::control(3));
        assert_eq!(tagged.without_request_id(), Address::control(3));
        assert!(!tagged.addressed_to(&Address::control(3)));
    }

    #[test]
    fn test_shorthand_all_hosts() {
        let addr = Address::from_shorthand_json(&json!("allHosts")).unwrap();
        assert_eq!(addr, Address::broadcast(AddressType::Host));
    }

    #[test]
    fn test_shorthand_objects() {
        assert_eq!(
            Address::from_shorthand_json(&json!({"hostId": 4})).unwrap(),
            Address::host(4)
        );
        assert_eq!(
            Address::from_shorthand_json(&json!({"instanceId": 11})).unwrap(),
            Address::instance(11)
        );
        assert_eq!(
            Address::from_shorthand_json(&json!({"controlId": 2})).unwrap(),
            Address::control(2)
        );
        assert_eq!(
            Address::from_shorthand_json(&json!("controller")).unwrap(),
            Address::controller()
        );
    }

    #[test]
    fn test_shorthand_rejects_unknown() {
        for bad in [
            json!("everyone"),
            json!({"userId": 1}),
            json!({"hostId": -1}),
            json!({"hostId": 1, "instanceId": 2}),
            json!(42),
        ] {
            let err = Address::from_shorthand_json(&bad).unwrap_err();
            assert!(matches!(err, AddressError::UnknownShorthand(_)), "{bad}");
        }
    }

    #[test]
    fn test_wire_form() {
        let value = serde_json::to_value(Address::host(7)).unwrap();
        assert_eq!(value, json!([2, 7]));

        let value = serde_json::to_value(Address::control(1).with_request_id(5)).unwrap();
        assert_eq!(value, json!([3, 1, 5]));

        let addr: Address = serde_json::from_value(json!([4, 1])).unwrap();
        assert_eq!(addr, Address::broadcast(AddressType::Instance));
    }

    #[test]
    fn test_wire_form_rejects_bad_input() {
        assert!(serde_json::from_value::<Address>(json!([5, 1])).is_err());
        assert!(serde_json::from_value::<Address>(json!([1])).is_err());
        assert!(serde_json::from_value::<Address>(json!([1, 2, 3, 4])).is_err());
        assert!(serde_json::from_value::<Address>(json!([4, 4])).is_err());
        assert!(serde_json::from_value::<Address>(json!({"type": 1})).is_err());
    }

    #[test]
    fn test_display() {
        assert_eq!(Address::host(3).to_string(), "host:3");
        assert_eq!(
            Address::broadcast(AddressType::Instance).to_string(),
            "broadcast:instance"
        );
        assert_eq!(Address::control(1).with_request_id(2).to_string(), "control:1#2");
    }
}
