use pcap::{Capture, Error as PcapError, Offline};
use pnet::packet::Packet;
use pnet::packet::ethernet::{EtherTypes, EthernetPacket};
use pnet::packet::ip::IpNextHeaderProtocols;
use pnet::packet::ipv4::{Ipv4Flags, Ipv4Packet};
use pnet::packet::udp::UdpPacket;
use std::collections::HashSet;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::dissector::{Dissection, RecordSource};
use crate::error::Error;
use crate::packet::PacketRecord;

/// PPP protocol number for IPv4
const PPP_IPV4: [u8; 2] = [0x00, 0x21];

/// Source, destination and IP identification of a fragmented datagram
type FragmentKey = (Ipv4Addr, Ipv4Addr, u16);

/// Link-layer framings we know how to strip.
#[derive(Debug, Clone, Copy, PartialEq)]
enum LinkKind {
    Ethernet,
    Ppp,
    RawIpv4,
}

impl LinkKind {
    fn from_datalink(dlt: i32) -> Option<Self> {
        match dlt {
            1 => Some(LinkKind::Ethernet),
            9 => Some(LinkKind::Ppp),
            // DLT_RAW differs between platforms; 228 is LINKTYPE_IPV4
            12 | 14 | 101 | 228 => Some(LinkKind::RawIpv4),
            _ => None,
        }
    }
}

/// Reads records straight from the capture with libpcap, no external tool.
#[derive(Debug, Clone)]
pub struct PcapSource {
    port: u16,
}

impl PcapSource {
    pub fn new(port: u16) -> Self {
        Self { port }
    }
}

impl RecordSource for PcapSource {
    fn name(&self) -> &'static str {
        "pcap"
    }

    fn dissect(&self, capture: &Path) -> Result<Dissection, Error> {
        let reader = PcapReader::new(capture, self.port)?;
        Ok(Dissection {
            records: Box::new(reader),
            artifact: None,
        })
    }
}

pub struct PcapReader {
    capture: Capture<Offline>,
    link: LinkKind,
    port: u16,
    path: PathBuf,
    first_timestamp: Option<f64>,
    /// Datagrams on our port whose last fragment has not been seen yet
    fragments: HashSet<FragmentKey>,
    sequence: u64,
    matched: u64,
    done: bool,
}

impl PcapReader {
    pub fn new(path: &Path, port: u16) -> Result<Self, Error> {
        debug!("Opening PCAP file with libpcap: {}", path.display());

        let capture = Capture::from_file(path)
            .map_err(|e| Error::dissection(path, format!("failed to open capture: {}", e)))?;
        let datalink = capture.get_datalink();
        let link = LinkKind::from_datalink(datalink.0).ok_or_else(|| {
            Error::dissection(path, format!("unsupported link type {}", datalink.0))
        })?;

        debug!("PCAP file opened successfully, link type {:?}", link);

        Ok(Self {
            capture,
            link,
            port,
            path: path.to_path_buf(),
            first_timestamp: None,
            fragments: HashSet::new(),
            sequence: 0,
            matched: 0,
            done: false,
        })
    }

    fn next_record(&mut self) -> Result<Option<PacketRecord>, Error> {
        loop {
            let packet = match self.capture.next_packet() {
                Ok(packet) => packet,
                Err(PcapError::NoMorePackets) => {
                    info!(
                        "Read {} packets from {}, {} on UDP port {}",
                        self.sequence,
                        self.path.display(),
                        self.matched,
                        self.port
                    );
                    return Ok(None);
                }
                Err(e) => {
                    return Err(Error::dissection(
                        &self.path,
                        format!("error reading packet #{}: {}", self.sequence + 1, e),
                    ));
                }
            };

            self.sequence += 1;

            // frame.time_relative is measured from the first frame, matching or not
            let packet_timestamp = packet.header.ts.tv_sec as f64
                + packet.header.ts.tv_usec as f64 / 1_000_000.0;
            let first = *self.first_timestamp.get_or_insert(packet_timestamp);

            let destination = match udp_destination(self.link, packet.data, self.port, &mut self.fragments) {
                Some(destination) => destination,
                None => continue,
            };
            self.matched += 1;

            return Ok(Some(PacketRecord::new(
                packet_timestamp - first,
                packet.header.len as f64,
                destination.to_string(),
            )));
        }
    }
}

impl Iterator for PcapReader {
    type Item = Result<PacketRecord, Error>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        let next = self.next_record().transpose();
        if !matches!(next, Some(Ok(_))) {
            self.done = true;
        }
        next
    }
}

/// IPv4 destination of a UDP datagram to or from `port`, if `frame` is one.
///
/// A fragmented datagram is reported once, on its last fragment, the way
/// tshark attributes a reassembled datagram to the frame that completes it.
fn udp_destination(
    link: LinkKind,
    frame: &[u8],
    port: u16,
    fragments: &mut HashSet<FragmentKey>,
) -> Option<Ipv4Addr> {
    match link {
        LinkKind::Ethernet => {
            let ethernet = EthernetPacket::new(frame)?;
            if ethernet.get_ethertype() != EtherTypes::Ipv4 {
                return None;
            }
            ipv4_udp_destination(ethernet.payload(), port, fragments)
        }
        LinkKind::Ppp => {
            // ns-3 point-to-point devices omit the address/control bytes
            let body = frame.strip_prefix(&[0xff, 0x03]).unwrap_or(frame);
            let (protocol, payload) = body.split_at_checked(2)?;
            if protocol != PPP_IPV4 {
                return None;
            }
            ipv4_udp_destination(payload, port, fragments)
        }
        LinkKind::RawIpv4 => ipv4_udp_destination(frame, port, fragments),
    }
}

fn ipv4_udp_destination(bytes: &[u8], port: u16, fragments: &mut HashSet<FragmentKey>) -> Option<Ipv4Addr> {
    let ipv4 = Ipv4Packet::new(bytes)?;
    if ipv4.get_version() != 4 || ipv4.get_next_level_protocol() != IpNextHeaderProtocols::Udp {
        return None;
    }

    let key = (ipv4.get_source(), ipv4.get_destination(), ipv4.get_identification());
    let more_fragments = ipv4.get_flags() & Ipv4Flags::MoreFragments != 0;

    // Later fragments carry no UDP header; the port is known from the first
    if ipv4.get_fragment_offset() != 0 {
        if !more_fragments && fragments.remove(&key) {
            return Some(ipv4.get_destination());
        }
        return None;
    }

    let udp = UdpPacket::new(ipv4.payload())?;
    if udp.get_source() != port && udp.get_destination() != port {
        return None;
    }

    if more_fragments {
        fragments.insert(key);
        return None;
    }
    Some(ipv4.get_destination())
}
