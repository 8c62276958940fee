//! Link classification: where a link sits in a route, and which side of it
//! a router occupies.

use core::fmt;

use serde::{Deserialize, Serialize};

/// The role of a link within a route.
///
/// A route has exactly one *central* link at any time: the privileged link
/// between the two ends' current representatives. Every other link is a
/// transient *peripheral* link left behind by an endpoint transfer, or a
/// *bridge* joining two locally-merged routes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LinkType {
    /// The one link between the two sides' current terminal representatives.
    Central,
    /// From a proxy toward the terminal router it forwards inbound parcels to.
    PeripheralInward,
    /// From a router toward the other end of the route, via a proxy.
    PeripheralOutward,
    /// Internal link joining two locally-merged routes.
    Bridge,
}

impl LinkType {
    /// Whether traffic on this link flows toward the other end of the route.
    pub fn is_outward(self) -> bool {
        matches!(self, LinkType::Central | LinkType::PeripheralOutward)
    }

    pub fn is_central(self) -> bool {
        matches!(self, LinkType::Central)
    }

    pub fn is_peripheral_inward(self) -> bool {
        matches!(self, LinkType::PeripheralInward)
    }

    pub fn is_bridge(self) -> bool {
        matches!(self, LinkType::Bridge)
    }
}

impl fmt::Display for LinkType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LinkType::Central => "central",
            LinkType::PeripheralInward => "peripheral-inward",
            LinkType::PeripheralOutward => "peripheral-outward",
            LinkType::Bridge => "bridge",
        };
        f.write_str(name)
    }
}

/// Which side of a link a router occupies. Agreed at link creation and fixed
/// for the link's lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LinkSide {
    A,
    B,
}

impl LinkSide {
    pub fn opposite(self) -> LinkSide {
        match self {
            LinkSide::A => LinkSide::B,
            LinkSide::B => LinkSide::A,
        }
    }

    pub fn is_a(self) -> bool {
        matches!(self, LinkSide::A)
    }
}

impl fmt::Display for LinkSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            LinkSide::A => "A",
            LinkSide::B => "B",
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn outward_types() {
        assert!(LinkType::Central.is_outward());
        assert!(LinkType::PeripheralOutward.is_outward());
        assert!(!LinkType::PeripheralInward.is_outward());
        assert!(!LinkType::Bridge.is_outward());
    }

    #[test]
    fn central_and_bridge_predicates() {
        assert!(LinkType::Central.is_central());
        assert!(!LinkType::Bridge.is_central());
        assert!(LinkType::Bridge.is_bridge());
        assert!(LinkType::PeripheralInward.is_peripheral_inward());
    }

    #[test]
    fn side_opposites() {
        assert_eq!(LinkSide::A.opposite(), LinkSide::B);
        assert_eq!(LinkSide::B.opposite(), LinkSide::A);
        assert_eq!(LinkSide::A.opposite().opposite(), LinkSide::A);
    }

    #[test]
    fn display_forms() {
        assert_eq!(LinkType::PeripheralOutward.to_string(), "peripheral-outward");
        assert_eq!(LinkSide::B.to_string(), "B");
    }
}
