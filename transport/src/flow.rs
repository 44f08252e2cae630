use std::fmt;
use std::net::{Ipv4Addr, SocketAddrV4};

/// A receive steering rule: packets matching the 4-tuple land on the
/// stream carrying this flow's tag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FourTupleFlow {
    pub tag: u32,
    pub source_ip: Ipv4Addr,
    /// Zero means "any source port".
    pub source_port: u16,
    pub destination: SocketAddrV4,
}

impl FourTupleFlow {
    pub fn new(
        tag: u32,
        source_ip: Ipv4Addr,
        source_port: u16,
        destination_ip: Ipv4Addr,
        destination_port: u16,
    ) -> Self {
        FourTupleFlow {
            tag,
            source_ip,
            source_port,
            destination: SocketAddrV4::new(destination_ip, destination_port),
        }
    }

    /// Source-address match applied on top of socket steering. An
    /// unspecified source IP accepts anything.
    pub fn matches_source(&self, source: &SocketAddrV4) -> bool {
        (self.source_ip.is_unspecified() || self.source_ip == *source.ip())
            && (self.source_port == 0 || self.source_port == source.port())
    }
}

impl fmt::Display for FourTupleFlow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "flow {} {}:{} -> {}",
            self.tag, self.source_ip, self.source_port, self.destination
        )
    }
}

#[cfg(test)]
mod flow_test {
    use super::*;

    #[test]
    fn test_source_matching() {
        let flow = FourTupleFlow::new(
            7,
            Ipv4Addr::new(10, 0, 0, 1),
            0,
            Ipv4Addr::new(239, 1, 1, 1),
            50020,
        );
        assert!(flow.matches_source(&SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 1), 1234)));
        assert!(!flow.matches_source(&SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 2), 1234)));

        let any = FourTupleFlow::new(8, Ipv4Addr::UNSPECIFIED, 0, Ipv4Addr::LOCALHOST, 9000);
        assert!(any.matches_source(&SocketAddrV4::new(Ipv4Addr::new(1, 2, 3, 4), 5)));

        let port_bound = FourTupleFlow::new(
            9,
            Ipv4Addr::new(10, 0, 0, 1),
            4000,
            Ipv4Addr::LOCALHOST,
            9000,
        );
        assert!(!port_bound.matches_source(&SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 1), 4001)));
        assert!(port_bound.matches_source(&SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 1), 4000)));
    }
}
