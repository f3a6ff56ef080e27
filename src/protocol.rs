use serde::Serialize;

/// IANA layer-4 protocol numbers the engine dispatches on.
///
/// Flow keys carry the raw `u8`; this enum only names the protocols a
/// dissector cares about. Anything else stays opaque and is still flow-tracked.
#[repr(u8)]
#[derive(Debug, PartialEq, Eq, Clone, Copy, PartialOrd, Ord, Serialize)]
pub enum ProtocolTypes {
    Icmp = 1,
    Igmp = 2,
    Tcp = 6,
    Udp = 17,
    Dccp = 33,
    Gre = 47,
    Esp = 50,
    Ah = 51,
    IcmpV6 = 58,
    Ospf = 89,
    Pim = 103,
    Sctp = 132,
    UdpLite = 136,
}

impl ProtocolTypes {
    pub fn from_u8(proto: u8) -> Option<ProtocolTypes> {
        match proto {
            1 => Some(ProtocolTypes::Icmp),
            2 => Some(ProtocolTypes::Igmp),
            6 => Some(ProtocolTypes::Tcp),
            17 => Some(ProtocolTypes::Udp),
            33 => Some(ProtocolTypes::Dccp),
            47 => Some(ProtocolTypes::Gre),
            50 => Some(ProtocolTypes::Esp),
            51 => Some(ProtocolTypes::Ah),
            58 => Some(ProtocolTypes::IcmpV6),
            89 => Some(ProtocolTypes::Ospf),
            103 => Some(ProtocolTypes::Pim),
            132 => Some(ProtocolTypes::Sctp),
            136 => Some(ProtocolTypes::UdpLite),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            ProtocolTypes::Icmp => "ICMP",
            ProtocolTypes::Igmp => "IGMP",
            ProtocolTypes::Tcp => "TCP",
            ProtocolTypes::Udp => "UDP",
            ProtocolTypes::Dccp => "DCCP",
            ProtocolTypes::Gre => "GRE",
            ProtocolTypes::Esp => "ESP",
            ProtocolTypes::Ah => "AH",
            ProtocolTypes::IcmpV6 => "ICMPv6",
            ProtocolTypes::Ospf => "OSPF",
            ProtocolTypes::Pim => "PIM",
            ProtocolTypes::Sctp => "SCTP",
            ProtocolTypes::UdpLite => "UDP-Lite",
        }
    }
}

impl std::fmt::Display for ProtocolTypes {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Protocols whose flow keys carry meaningful port numbers.
/// Everything else gets port 0 in the key.
pub fn is_port_based(proto: u8) -> bool {
    matches!(proto, 6 | 17 | 33 | 132 | 136)
}

pub const L3_ICMP: u8 = 1;
pub const L3_IGMP: u8 = 2;
pub const L3_TCP: u8 = 6;
pub const L3_UDP: u8 = 17;
pub const L3_ICMP6: u8 = 58;
pub const L3_OSPF: u8 = 89;
pub const L3_SCTP: u8 = 132;
pub const L3_UDPLITE: u8 = 136;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_known_protocols() {
        for p in [1u8, 2, 6, 17, 33, 47, 50, 51, 58, 89, 103, 132, 136] {
            let t = ProtocolTypes::from_u8(p).unwrap();
            assert_eq!(t as u8, p);
        }
        assert!(ProtocolTypes::from_u8(250).is_none());
    }

    #[test]
    fn port_classes() {
        assert!(is_port_based(L3_TCP));
        assert!(is_port_based(L3_UDPLITE));
        assert!(!is_port_based(L3_OSPF));
        assert!(!is_port_based(L3_ICMP));
    }
}
