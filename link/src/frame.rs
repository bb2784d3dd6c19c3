//! Link-layer framing.
//!
//! Every frame starts with a fixed 14-byte header:
//!
//! ```text
//! +----------+----------------------+----------------------+---------
//! | tag (2)  | destination (6)      | source (6)           | payload
//! +----------+----------------------+----------------------+---------
//! ```
//!
//! The tag is a point-to-point protocol number in network byte order. Upper
//! layers speak ethertypes; the mapping between the two is a fixed table and
//! anything outside it is a configuration bug (and panics).

use bytes::{Buf, BufMut, Bytes, BytesMut};
use commonware_codec::{Error, FixedSize, Read, ReadExt as _, Write};
use std::{fmt, str::FromStr};

/// Size of the encoded [Header].
pub const HEADER_LEN: usize = 14;

/// Largest payload a frame may carry (the largest configurable MTU).
pub const MAX_PAYLOAD_LEN: usize = u16::MAX as usize;

/// Largest frame [encapsulate] will produce.
pub const MAX_FRAME_LEN: usize = HEADER_LEN + MAX_PAYLOAD_LEN;

/// Ethertype of IPv4.
pub const ETHERTYPE_IPV4: u16 = 0x0800;

/// Ethertype of IPv6.
pub const ETHERTYPE_IPV6: u16 = 0x86DD;

/// Point-to-point protocol number of IPv4.
pub const TAG_IPV4: u16 = 0x0021;

/// Point-to-point protocol number of IPv6.
pub const TAG_IPV6: u16 = 0x0057;

/// Map an ethertype to its point-to-point protocol tag.
///
/// Panics if the ethertype has no tag.
pub fn ether_to_tag(ethertype: u16) -> u16 {
    match ethertype {
        ETHERTYPE_IPV4 => TAG_IPV4,
        ETHERTYPE_IPV6 => TAG_IPV6,
        other => panic!("no protocol tag defined for ethertype {other:#06x}"),
    }
}

/// Map a point-to-point protocol tag to its ethertype.
///
/// Panics if the tag is unknown.
pub fn tag_to_ether(tag: u16) -> u16 {
    match tag {
        TAG_IPV4 => ETHERTYPE_IPV4,
        TAG_IPV6 => ETHERTYPE_IPV6,
        other => panic!("protocol tag {other:#06x} is not defined"),
    }
}

/// Flat 6-byte link-layer address.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Address([u8; 6]);

impl Address {
    /// The broadcast address (`ff:ff:ff:ff:ff:ff`).
    pub const BROADCAST: Self = Self([0xff; 6]);

    /// Base of IPv4 multicast addresses (`01:00:5e:00:00:00`).
    pub const IPV4_MULTICAST: Self = Self([0x01, 0x00, 0x5e, 0x00, 0x00, 0x00]);

    /// Base of IPv6 multicast addresses (`33:33:00:00:00:00`).
    pub const IPV6_MULTICAST: Self = Self([0x33, 0x33, 0x00, 0x00, 0x00, 0x00]);

    pub const fn new(octets: [u8; 6]) -> Self {
        Self(octets)
    }

    pub const fn octets(&self) -> [u8; 6] {
        self.0
    }

    /// Build an address from the low 48 bits of `value`.
    pub fn from_u64(value: u64) -> Self {
        let bytes = value.to_be_bytes();
        let mut octets = [0u8; 6];
        octets.copy_from_slice(&bytes[2..]);
        Self(octets)
    }

    pub fn is_broadcast(&self) -> bool {
        *self == Self::BROADCAST
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d, e, g] = self.0;
        write!(f, "{a:02x}:{b:02x}:{c:02x}:{d:02x}:{e:02x}:{g:02x}")
    }
}

/// Error returned when parsing a malformed [Address].
#[derive(Debug, PartialEq, Eq)]
pub struct AddressParseError(pub String);

impl fmt::Display for AddressParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid address: {}", self.0)
    }
}

impl std::error::Error for AddressParseError {}

impl FromStr for Address {
    type Err = AddressParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut octets = [0u8; 6];
        let mut parts = s.split(':');
        for octet in octets.iter_mut() {
            let part = parts
                .next()
                .ok_or_else(|| AddressParseError(s.to_string()))?;
            if part.len() != 2 {
                return Err(AddressParseError(s.to_string()));
            }
            *octet =
                u8::from_str_radix(part, 16).map_err(|_| AddressParseError(s.to_string()))?;
        }
        if parts.next().is_some() {
            return Err(AddressParseError(s.to_string()));
        }
        Ok(Self(octets))
    }
}

impl Write for Address {
    fn write(&self, buf: &mut impl BufMut) {
        self.0.write(buf);
    }
}

impl Read for Address {
    type Cfg = ();

    fn read_cfg(buf: &mut impl Buf, _: &()) -> Result<Self, Error> {
        Ok(Self(<[u8; 6]>::read(buf)?))
    }
}

impl FixedSize for Address {
    const SIZE: usize = 6;
}

/// Header prepended to every frame on the link.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Header {
    /// Point-to-point protocol tag (not an ethertype).
    pub tag: u16,
    pub destination: Address,
    pub source: Address,
}

impl Header {
    /// Build a header for a payload of the given ethertype.
    ///
    /// Panics if the ethertype has no protocol tag.
    pub fn for_ethertype(ethertype: u16, destination: Address, source: Address) -> Self {
        Self {
            tag: ether_to_tag(ethertype),
            destination,
            source,
        }
    }

    /// Ethertype carried by this header.
    ///
    /// Panics if the tag is unknown.
    pub fn ethertype(&self) -> u16 {
        tag_to_ether(self.tag)
    }
}

impl Write for Header {
    fn write(&self, buf: &mut impl BufMut) {
        self.tag.write(buf);
        self.destination.write(buf);
        self.source.write(buf);
    }
}

impl Read for Header {
    type Cfg = ();

    fn read_cfg(buf: &mut impl Buf, _: &()) -> Result<Self, Error> {
        let tag = u16::read(buf)?;
        let destination = Address::read(buf)?;
        let source = Address::read(buf)?;
        Ok(Self {
            tag,
            destination,
            source,
        })
    }
}

impl FixedSize for Header {
    const SIZE: usize = HEADER_LEN;
}

impl fmt::Display for Header {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let protocol = match self.tag {
            TAG_IPV4 => "IP",
            TAG_IPV6 => "IPv6",
            _ => "unknown",
        };
        write!(
            f,
            "Point-to-Point Protocol: {} ({:#06x}) {} > {}",
            protocol, self.tag, self.source, self.destination
        )
    }
}

/// A frame after its header has been stripped.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Decapsulated {
    pub ethertype: u16,
    pub destination: Address,
    pub source: Address,
    pub payload: Bytes,
}

/// Prepend a header to `payload`.
///
/// Panics if the ethertype has no protocol tag or if `payload` is longer than
/// [MAX_PAYLOAD_LEN].
pub fn encapsulate(payload: &[u8], ethertype: u16, destination: Address, source: Address) -> Bytes {
    assert!(
        payload.len() <= MAX_PAYLOAD_LEN,
        "payload of {} bytes exceeds the largest frame ({MAX_PAYLOAD_LEN} bytes)",
        payload.len()
    );
    let header = Header::for_ethertype(ethertype, destination, source);
    let mut frame = BytesMut::with_capacity(HEADER_LEN + payload.len());
    header.write(&mut frame);
    frame.put_slice(payload);
    frame.freeze()
}

/// Strip the header from `frame`.
///
/// Panics if the frame is shorter than a header or carries an unknown tag:
/// frames only ever come from [encapsulate], so either indicates a bug.
pub fn decapsulate(mut frame: Bytes) -> Decapsulated {
    let header = Header::read(&mut frame).expect("frame shorter than its header");
    Decapsulated {
        ethertype: header.ethertype(),
        destination: header.destination,
        source: header.source,
        payload: frame,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use commonware_codec::{DecodeExt as _, Encode as _};
    use commonware_macros::test_traced;
    use test_case::test_case;

    #[test_traced]
    fn test_header_round_trip() {
        let a: Address = "aa:aa:aa:aa:aa:aa".parse().unwrap();
        let b: Address = "bb:bb:bb:bb:bb:bb".parse().unwrap();
        let header = Header {
            tag: TAG_IPV4,
            destination: b,
            source: a,
        };
        let encoded = header.encode();
        assert_eq!(encoded.len(), HEADER_LEN);
        assert_eq!(&encoded[..2], &[0x00, 0x21]);
        assert_eq!(&encoded[2..8], &[0xbb; 6]);
        assert_eq!(&encoded[8..14], &[0xaa; 6]);

        let decoded = Header::decode(encoded.freeze()).unwrap();
        assert_eq!(decoded, header);
        assert_eq!(decoded.ethertype(), ETHERTYPE_IPV4);
    }

    #[test_traced]
    fn test_encapsulate_decapsulate() {
        let a = Address::new([0xaa; 6]);
        let b = Address::new([0xbb; 6]);
        let frame = encapsulate(b"hello", ETHERTYPE_IPV6, b, a);
        assert_eq!(frame.len(), HEADER_LEN + 5);
        assert_eq!(&frame[..2], &[0x00, 0x57]);

        let decapsulated = decapsulate(frame);
        assert_eq!(decapsulated.ethertype, ETHERTYPE_IPV6);
        assert_eq!(decapsulated.destination, b);
        assert_eq!(decapsulated.source, a);
        assert_eq!(decapsulated.payload.as_ref(), b"hello");
    }

    #[test_case(ETHERTYPE_IPV4, TAG_IPV4; "ipv4")]
    #[test_case(ETHERTYPE_IPV6, TAG_IPV6; "ipv6")]
    fn test_protocol_table(ethertype: u16, tag: u16) {
        assert_eq!(ether_to_tag(ethertype), tag);
        assert_eq!(tag_to_ether(tag), ethertype);
    }

    #[test_traced]
    #[should_panic(expected = "no protocol tag defined for ethertype 0x0806")]
    fn test_unmapped_ethertype_panics() {
        encapsulate(b"arp", 0x0806, Address::BROADCAST, Address::new([1; 6]));
    }

    #[test_traced]
    #[should_panic(expected = "protocol tag 0x00ff is not defined")]
    fn test_unmapped_tag_panics() {
        let mut frame = BytesMut::new();
        Header {
            tag: 0x00ff,
            destination: Address::BROADCAST,
            source: Address::BROADCAST,
        }
        .write(&mut frame);
        decapsulate(frame.freeze());
    }

    #[test_traced]
    fn test_truncated_header() {
        let short = Bytes::from_static(&[0x00, 0x21, 0xff]);
        assert!(matches!(Header::decode(short), Err(Error::EndOfBuffer)));
    }

    #[test_traced]
    fn test_trailing_bytes_rejected() {
        let header = Header::for_ethertype(ETHERTYPE_IPV4, Address::BROADCAST, Address::new([1; 6]));
        let mut encoded = header.encode();
        encoded.put_u8(0);
        assert!(matches!(
            Header::decode(encoded.freeze()),
            Err(Error::ExtraData(1))
        ));
    }

    #[test_traced]
    fn test_largest_payload_fits() {
        let payload = vec![0u8; MAX_PAYLOAD_LEN];
        let frame = encapsulate(&payload, ETHERTYPE_IPV4, Address::BROADCAST, Address::new([1; 6]));
        assert_eq!(frame.len(), MAX_FRAME_LEN);
        assert_eq!(decapsulate(frame).payload.len(), MAX_PAYLOAD_LEN);
    }

    #[test_traced]
    #[should_panic(expected = "payload of 65536 bytes exceeds the largest frame")]
    fn test_oversized_payload_panics() {
        let payload = vec![0u8; MAX_PAYLOAD_LEN + 1];
        encapsulate(&payload, ETHERTYPE_IPV4, Address::BROADCAST, Address::new([1; 6]));
    }

    #[test_case("aa:bb:cc:dd:ee:ff", Some([0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0xff]); "valid")]
    #[test_case("aa:bb:cc:dd:ee", None; "too short")]
    #[test_case("aa:bb:cc:dd:ee:ff:00", None; "too long")]
    #[test_case("aa:bb:cc:dd:ee:zz", None; "not hex")]
    #[test_case("aabb:cc:dd:ee:ff", None; "bad grouping")]
    fn test_address_parse(input: &str, expected: Option<[u8; 6]>) {
        let parsed = input.parse::<Address>().ok().map(|a| a.octets());
        assert_eq!(parsed, expected);
    }

    #[test_traced]
    fn test_address_display() {
        assert_eq!(Address::BROADCAST.to_string(), "ff:ff:ff:ff:ff:ff");
        assert_eq!(Address::IPV4_MULTICAST.to_string(), "01:00:5e:00:00:00");
        assert_eq!(Address::from_u64(0x0102).to_string(), "00:00:00:00:01:02");
        assert!(Address::BROADCAST.is_broadcast());
        assert!(!Address::from_u64(1).is_broadcast());
    }
}
