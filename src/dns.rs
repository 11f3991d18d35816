//! DNS message parsing and construction.
//!
//! Decoding never reads past the end of the buffer and never follows a
//! compression pointer forwards, so every name decode terminates.

use std::borrow::Cow;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use serde::{Serialize, Serializer};

use crate::error::ParseError;

pub const HEADER_LEN: usize = 12;

/// Maximum encoded length of a name, including length octets and the root label.
const MAX_NAME_LEN: usize = 255;
const MAX_LABEL_LEN: usize = 63;

pub const TYPE_A: u16 = 1;
pub const TYPE_NS: u16 = 2;
pub const TYPE_CNAME: u16 = 5;
pub const TYPE_PTR: u16 = 12;
pub const TYPE_AAAA: u16 = 28;
pub const CLASS_IN: u16 = 1;

const FLAG_QR: u16 = 0x8000;
const FLAG_RD: u16 = 0x0100;
const FLAG_RA: u16 = 0x0080;
const OPCODE_MASK: u16 = 0x7800;

pub const RCODE_NOERROR: u8 = 0;
pub const RCODE_NXDOMAIN: u8 = 3;

/// Fixed 12-byte message header, decoded into host byte order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct DnsHeader {
    pub id: u16,
    pub flags: u16,
    pub qdcount: u16,
    pub ancount: u16,
    pub nscount: u16,
    pub arcount: u16,
}

impl DnsHeader {
    /// Parse the header from the first 12 bytes of `data`.
    pub fn parse(data: &[u8]) -> Result<Self, ParseError> {
        if data.len() < HEADER_LEN {
            return Err(ParseError::Truncated { offset: data.len() });
        }
        let word = |i: usize| u16::from_be_bytes([data[i], data[i + 1]]);

        Ok(Self {
            id: word(0),
            flags: word(2),
            qdcount: word(4),
            ancount: word(6),
            nscount: word(8),
            arcount: word(10),
        })
    }

    /// True when the QR bit marks this message as a response.
    pub fn is_response(&self) -> bool {
        self.flags & FLAG_QR != 0
    }

    pub fn opcode(&self) -> u8 {
        ((self.flags & OPCODE_MASK) >> 11) as u8
    }

    pub fn rcode(&self) -> u8 {
        (self.flags & 0x000F) as u8
    }

    fn write(&self, buf: &mut Vec<u8>) {
        for word in [
            self.id,
            self.flags,
            self.qdcount,
            self.ancount,
            self.nscount,
            self.arcount,
        ] {
            buf.extend_from_slice(&word.to_be_bytes());
        }
    }
}

/// A DNS question section entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Question {
    pub name: String,
    #[serde(serialize_with = "serialize_type")]
    pub qtype: u16,
    pub qclass: u16,
}

/// Decoded resource data.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum RData {
    A(Ipv4Addr),
    Aaaa(Ipv6Addr),
    /// CNAME, NS and PTR targets.
    Name(String),
    Other(#[serde(serialize_with = "serialize_hex")] Vec<u8>),
}

/// A DNS resource record (answer, authority or additional).
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResourceRecord {
    pub name: String,
    #[serde(rename = "type", serialize_with = "serialize_type")]
    pub rtype: u16,
    pub class: u16,
    pub ttl: u32,
    pub data: RData,
}

impl ResourceRecord {
    /// The address carried by an A or AAAA record.
    pub fn address(&self) -> Option<IpAddr> {
        match self.data {
            RData::A(ip) => Some(IpAddr::V4(ip)),
            RData::Aaaa(ip) => Some(IpAddr::V6(ip)),
            _ => None,
        }
    }
}

/// A fully decoded DNS message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DnsMessage {
    pub header: DnsHeader,
    pub questions: Vec<Question>,
    pub answers: Vec<ResourceRecord>,
    pub authorities: Vec<ResourceRecord>,
    pub additionals: Vec<ResourceRecord>,
}

impl DnsMessage {
    /// Parse a DNS message from raw bytes.
    ///
    /// Sections are decoded in order; the first structural violation aborts
    /// the whole decode.
    pub fn parse(data: &[u8]) -> Result<Self, ParseError> {
        let header = DnsHeader::parse(data)?;
        let mut pos = HEADER_LEN;

        let mut questions = Vec::with_capacity(usize::from(header.qdcount).min(16));
        for found in 0..header.qdcount {
            if pos >= data.len() {
                return Err(ParseError::RecordCountMismatch {
                    section: "question",
                    expected: header.qdcount,
                    found,
                });
            }
            let (name, next) = read_name(data, pos)?;
            let fixed = data
                .get(next..next + 4)
                .ok_or(ParseError::Truncated { offset: next })?;
            questions.push(Question {
                name,
                qtype: u16::from_be_bytes([fixed[0], fixed[1]]),
                qclass: u16::from_be_bytes([fixed[2], fixed[3]]),
            });
            pos = next + 4;
        }

        let answers = read_records(data, &mut pos, header.ancount, "answer")?;
        let authorities = read_records(data, &mut pos, header.nscount, "authority")?;
        let additionals = read_records(data, &mut pos, header.arcount, "additional")?;

        Ok(Self {
            header,
            questions,
            answers,
            authorities,
            additionals,
        })
    }

    /// The first question, which is the only one resolvers act on in practice.
    pub fn question(&self) -> Option<&Question> {
        self.questions.first()
    }

    /// All (owner name, address) pairs from A/AAAA answers.
    pub fn answer_addresses(&self) -> impl Iterator<Item = (&str, IpAddr)> {
        self.answers
            .iter()
            .filter_map(|rr| rr.address().map(|ip| (rr.name.as_str(), ip)))
    }

    /// Build the sinkhole answer for a blocked query.
    ///
    /// A and AAAA questions get an unspecified address; anything else gets
    /// NXDOMAIN with no answers.
    pub fn blocked_response(&self) -> DnsMessage {
        let mut answers = Vec::new();
        let mut rcode = RCODE_NXDOMAIN;
        if let Some(q) = self.question() {
            let data = match q.qtype {
                TYPE_A => Some(RData::A(Ipv4Addr::UNSPECIFIED)),
                TYPE_AAAA => Some(RData::Aaaa(Ipv6Addr::UNSPECIFIED)),
                _ => None,
            };
            if let Some(data) = data {
                rcode = RCODE_NOERROR;
                answers.push(ResourceRecord {
                    name: q.name.clone(),
                    rtype: q.qtype,
                    class: q.qclass,
                    ttl: 300,
                    data,
                });
            }
        }

        let flags = FLAG_QR
            | (self.header.flags & (OPCODE_MASK | FLAG_RD))
            | FLAG_RA
            | u16::from(rcode);

        DnsMessage {
            header: DnsHeader {
                id: self.header.id,
                flags,
                qdcount: self.questions.len() as u16,
                ancount: answers.len() as u16,
                nscount: 0,
                arcount: 0,
            },
            questions: self.questions.clone(),
            answers,
            authorities: Vec::new(),
            additionals: Vec::new(),
        }
    }

    /// Encode the message to wire format bytes, without name compression.
    ///
    /// Section counts are taken from the section lengths.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut data = Vec::with_capacity(512);

        DnsHeader {
            qdcount: self.questions.len() as u16,
            ancount: self.answers.len() as u16,
            nscount: self.authorities.len() as u16,
            arcount: self.additionals.len() as u16,
            ..self.header
        }
        .write(&mut data);

        for q in &self.questions {
            encode_name(&mut data, &q.name);
            data.extend_from_slice(&q.qtype.to_be_bytes());
            data.extend_from_slice(&q.qclass.to_be_bytes());
        }

        for rr in self
            .answers
            .iter()
            .chain(&self.authorities)
            .chain(&self.additionals)
        {
            encode_name(&mut data, &rr.name);
            data.extend_from_slice(&rr.rtype.to_be_bytes());
            data.extend_from_slice(&rr.class.to_be_bytes());
            data.extend_from_slice(&rr.ttl.to_be_bytes());

            let rdata = match &rr.data {
                RData::A(ip) => ip.octets().to_vec(),
                RData::Aaaa(ip) => ip.octets().to_vec(),
                RData::Name(name) => {
                    let mut buf = Vec::new();
                    encode_name(&mut buf, name);
                    buf
                }
                RData::Other(bytes) => bytes.clone(),
            };
            data.extend_from_slice(&(rdata.len() as u16).to_be_bytes());
            data.extend_from_slice(&rdata);
        }

        data
    }
}

fn read_records(
    data: &[u8],
    pos: &mut usize,
    count: u16,
    section: &'static str,
) -> Result<Vec<ResourceRecord>, ParseError> {
    let mut records = Vec::with_capacity(usize::from(count).min(32));

    for found in 0..count {
        if *pos >= data.len() {
            return Err(ParseError::RecordCountMismatch {
                section,
                expected: count,
                found,
            });
        }

        let (name, next) = read_name(data, *pos)?;
        let fixed = data
            .get(next..next + 10)
            .ok_or(ParseError::Truncated { offset: next })?;
        let rtype = u16::from_be_bytes([fixed[0], fixed[1]]);
        let class = u16::from_be_bytes([fixed[2], fixed[3]]);
        let ttl = u32::from_be_bytes([fixed[4], fixed[5], fixed[6], fixed[7]]);
        let rdlength = usize::from(u16::from_be_bytes([fixed[8], fixed[9]]));

        let start = next + 10;
        let rdata = data
            .get(start..start + rdlength)
            .ok_or(ParseError::Truncated { offset: start })?;

        let decoded = match (rtype, rdlength) {
            (TYPE_A, 4) => RData::A(Ipv4Addr::new(rdata[0], rdata[1], rdata[2], rdata[3])),
            (TYPE_AAAA, 16) => {
                let mut octets = [0u8; 16];
                octets.copy_from_slice(rdata);
                RData::Aaaa(Ipv6Addr::from(octets))
            }
            (TYPE_CNAME | TYPE_NS | TYPE_PTR, _) => {
                let (target, end) = read_name(data, start)?;
                if end > start + rdlength {
                    return Err(ParseError::MalformedName {
                        offset: start,
                        reason: "name overruns record data",
                    });
                }
                RData::Name(target)
            }
            _ => RData::Other(rdata.to_vec()),
        };

        records.push(ResourceRecord {
            name,
            rtype,
            class,
            ttl,
            data: decoded,
        });
        *pos = start + rdlength;
    }

    Ok(records)
}

/// Decode the name starting at `start`.
///
/// Returns the dotted name and the offset just past the name as it appears
/// at `start` (past the first pointer, if the name is compressed). Each
/// pointer must target an offset strictly before the start of the label run
/// it terminates, so targets strictly decrease; hops are also capped at the
/// packet length.
fn read_name(data: &[u8], start: usize) -> Result<(String, usize), ParseError> {
    let mut name = String::new();
    let mut pos = start;
    let mut limit = start;
    let mut end = None;
    let mut wire_len = 0usize;
    let mut hops = 0usize;

    loop {
        let len = usize::from(*data.get(pos).ok_or(ParseError::Truncated { offset: pos })?);

        match len & 0xC0 {
            0x00 if len == 0 => {
                let end = end.unwrap_or(pos + 1);
                if name.is_empty() {
                    name.push('.');
                }
                return Ok((name, end));
            }
            0x00 => {
                let label = data
                    .get(pos + 1..pos + 1 + len)
                    .ok_or(ParseError::Truncated { offset: pos + 1 })?;
                wire_len += len + 1;
                if wire_len >= MAX_NAME_LEN {
                    return Err(ParseError::MalformedName {
                        offset: pos,
                        reason: "name exceeds 255 bytes",
                    });
                }
                if !name.is_empty() {
                    name.push('.');
                }
                push_label(&mut name, label);
                pos += 1 + len;
            }
            0xC0 => {
                let low = *data
                    .get(pos + 1)
                    .ok_or(ParseError::Truncated { offset: pos + 1 })?;
                let target = ((len & 0x3F) << 8) | usize::from(low);
                hops += 1;
                if target >= limit || hops > data.len() {
                    return Err(ParseError::PointerCycle { offset: pos });
                }
                if end.is_none() {
                    end = Some(pos + 2);
                }
                pos = target;
                limit = target;
            }
            _ => {
                return Err(ParseError::MalformedName {
                    offset: pos,
                    reason: "reserved label type",
                });
            }
        }
    }
}

/// Append a label, escaping bytes that would make the dotted form ambiguous.
fn push_label(name: &mut String, label: &[u8]) {
    for &b in label {
        match b {
            b'.' | b'\\' => {
                name.push('\\');
                name.push(char::from(b));
            }
            0x21..=0x7E => name.push(char::from(b)),
            _ => name.push_str(&format!("\\{b:03}")),
        }
    }
}

/// Split a dotted name into raw labels, undoing the escapes `push_label` writes.
fn name_labels(name: &str) -> Vec<Vec<u8>> {
    let bytes = name.as_bytes();
    let mut labels = Vec::new();
    let mut label = Vec::new();
    let mut i = 0;

    while i < bytes.len() {
        match bytes[i] {
            b'\\' => {
                let decimal = bytes
                    .get(i + 1..i + 4)
                    .filter(|d| d.iter().all(u8::is_ascii_digit))
                    .and_then(|d| std::str::from_utf8(d).ok()?.parse::<u8>().ok());
                match decimal {
                    Some(b) => {
                        label.push(b);
                        i += 4;
                    }
                    None => {
                        label.extend(bytes.get(i + 1));
                        i += 2;
                    }
                }
            }
            b'.' => {
                if !label.is_empty() {
                    labels.push(std::mem::take(&mut label));
                }
                i += 1;
            }
            b => {
                label.push(b);
                i += 1;
            }
        }
    }
    if !label.is_empty() {
        labels.push(label);
    }

    labels
}

/// Encode a dotted name. Labels are cut to 63 bytes and labels that would
/// push the name past 255 bytes are left out, so the output always decodes.
fn encode_name(buf: &mut Vec<u8>, name: &str) {
    let mut wire_len = 0usize;
    for mut label in name_labels(name) {
        label.truncate(MAX_LABEL_LEN);
        if wire_len + label.len() + 1 >= MAX_NAME_LEN {
            break;
        }
        wire_len += label.len() + 1;
        buf.push(label.len() as u8);
        buf.extend_from_slice(&label);
    }
    buf.push(0);
}

/// Human-readable mnemonic for a record type.
pub fn type_name(rtype: u16) -> Cow<'static, str> {
    match rtype {
        TYPE_A => "A".into(),
        TYPE_NS => "NS".into(),
        TYPE_CNAME => "CNAME".into(),
        6 => "SOA".into(),
        TYPE_PTR => "PTR".into(),
        15 => "MX".into(),
        16 => "TXT".into(),
        TYPE_AAAA => "AAAA".into(),
        33 => "SRV".into(),
        41 => "OPT".into(),
        64 => "SVCB".into(),
        65 => "HTTPS".into(),
        n => format!("TYPE{n}").into(),
    }
}

fn serialize_type<S: Serializer>(rtype: &u16, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&type_name(*rtype))
}

fn serialize_hex<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
    let hex: String = bytes.iter().map(|b| format!("{b:02x}")).collect();
    serializer.serialize_str(&hex)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Build a query packet the way a stub resolver would.
    pub(crate) fn query_packet(id: u16, domain: &str, qtype: u16) -> Vec<u8> {
        DnsMessage {
            header: DnsHeader {
                id,
                flags: FLAG_RD,
                ..DnsHeader::default()
            },
            questions: vec![Question {
                name: domain.to_string(),
                qtype,
                qclass: CLASS_IN,
            }],
            answers: Vec::new(),
            authorities: Vec::new(),
            additionals: Vec::new(),
        }
        .to_bytes()
    }

    /// Build a compressed A response: answer names point at the question.
    pub(crate) fn a_response_packet(id: u16, domain: &str, addrs: &[Ipv4Addr]) -> Vec<u8> {
        let mut packet = query_packet(id, domain, TYPE_A);
        packet[2] = 0x81;
        packet[3] = 0x80;
        packet[6..8].copy_from_slice(&(addrs.len() as u16).to_be_bytes());
        for ip in addrs {
            packet.extend_from_slice(&[0xC0, 0x0C]);
            packet.extend_from_slice(&TYPE_A.to_be_bytes());
            packet.extend_from_slice(&CLASS_IN.to_be_bytes());
            packet.extend_from_slice(&60u32.to_be_bytes());
            packet.extend_from_slice(&4u16.to_be_bytes());
            packet.extend_from_slice(&ip.octets());
        }
        packet
    }

    fn sample_message() -> DnsMessage {
        DnsMessage {
            header: DnsHeader {
                id: 0xBEEF,
                flags: 0x8180,
                qdcount: 1,
                ancount: 3,
                nscount: 0,
                arcount: 1,
            },
            questions: vec![Question {
                name: "www.example.com".to_string(),
                qtype: TYPE_A,
                qclass: CLASS_IN,
            }],
            answers: vec![
                ResourceRecord {
                    name: "www.example.com".to_string(),
                    rtype: TYPE_CNAME,
                    class: CLASS_IN,
                    ttl: 120,
                    data: RData::Name("example.com".to_string()),
                },
                ResourceRecord {
                    name: "example.com".to_string(),
                    rtype: TYPE_A,
                    class: CLASS_IN,
                    ttl: 300,
                    data: RData::A(Ipv4Addr::new(93, 184, 216, 34)),
                },
                ResourceRecord {
                    name: "example.com".to_string(),
                    rtype: TYPE_AAAA,
                    class: CLASS_IN,
                    ttl: 300,
                    data: RData::Aaaa("2606:2800:220:1::248".parse().unwrap()),
                },
            ],
            authorities: Vec::new(),
            additionals: vec![ResourceRecord {
                name: ".".to_string(),
                rtype: 41,
                class: 1232,
                ttl: 0,
                data: RData::Other(Vec::new()),
            }],
        }
    }

    #[test]
    fn parse_round_trips_uncompressed_message() {
        let message = sample_message();

        let parsed = DnsMessage::parse(&message.to_bytes()).unwrap();

        assert_eq!(parsed, message);
    }

    #[test]
    fn parse_header_fields_are_big_endian() {
        let packet = [0x12, 0x34, 0x81, 0x83, 0, 1, 0, 2, 0, 3, 0, 4];

        let header = DnsHeader::parse(&packet).unwrap();

        assert_eq!(header.id, 0x1234);
        assert_eq!(header.flags, 0x8183);
        assert_eq!(
            (header.qdcount, header.ancount, header.nscount, header.arcount),
            (1, 2, 3, 4)
        );
        assert!(header.is_response());
        assert_eq!(header.rcode(), RCODE_NXDOMAIN);
        assert_eq!(header.opcode(), 0);
    }

    #[test]
    fn parse_rejects_short_packet_as_truncated() {
        let err = DnsMessage::parse(&[0, 1, 2, 3, 4]).unwrap_err();

        assert_eq!(err, ParseError::Truncated { offset: 5 });
    }

    #[test]
    fn compressed_name_matches_uncompressed_equivalent() {
        let packet = a_response_packet(7, "Example.com", &[Ipv4Addr::new(93, 184, 216, 34)]);

        let message = DnsMessage::parse(&packet).unwrap();

        assert_eq!(message.answers[0].name, message.questions[0].name);
        assert_eq!(message.answers[0].name, "Example.com");
        assert_eq!(
            message.answer_addresses().collect::<Vec<_>>(),
            vec![("Example.com", IpAddr::V4(Ipv4Addr::new(93, 184, 216, 34)))]
        );
    }

    #[test]
    fn pointer_chain_through_label_suffix_decodes() {
        // "www" + pointer to "example.com" at offset 12.
        let mut packet = query_packet(1, "example.com", TYPE_A);
        packet[5] = 2;
        let second = packet.len();
        packet.extend_from_slice(&[3, b'w', b'w', b'w', 0xC0, 0x0C]);
        packet.extend_from_slice(&[0, 1, 0, 1]);
        // Third name points at the second, which itself ends in a pointer.
        packet.extend_from_slice(&[0xC0, second as u8]);
        packet.extend_from_slice(&[0, 1, 0, 1, 0, 0, 0, 10, 0, 4, 10, 0, 0, 1]);
        packet[7] = 1;

        let message = DnsMessage::parse(&packet).unwrap();

        assert_eq!(message.questions[1].name, "www.example.com");
        assert_eq!(message.answers[0].name, "www.example.com");
    }

    #[test]
    fn pointer_loop_is_rejected() {
        // Offset 12 points to 14, which points back to 12.
        let mut packet = vec![0, 1, 0, 0, 0, 1, 0, 0, 0, 0, 0, 0];
        packet.extend_from_slice(&[0xC0, 14, 0xC0, 12, 0, 1, 0, 1]);

        let err = DnsMessage::parse(&packet).unwrap_err();

        assert_eq!(err, ParseError::PointerCycle { offset: 12 });
    }

    #[test]
    fn pointer_back_into_own_labels_is_rejected() {
        // "a" followed by a pointer to its own first label.
        let mut packet = vec![0, 1, 0, 0, 0, 1, 0, 0, 0, 0, 0, 0];
        packet.extend_from_slice(&[1, b'a', 0xC0, 12, 0, 1, 0, 1]);

        let err = DnsMessage::parse(&packet).unwrap_err();

        assert_eq!(err, ParseError::PointerCycle { offset: 14 });
    }

    #[test]
    fn self_pointer_is_rejected() {
        let mut packet = vec![0, 1, 0, 0, 0, 1, 0, 0, 0, 0, 0, 0];
        packet.extend_from_slice(&[0xC0, 0x0C, 0, 1, 0, 1]);

        let err = DnsMessage::parse(&packet).unwrap_err();

        assert_eq!(err.kind(), crate::error::ParseErrorKind::PointerCycle);
    }

    #[test]
    fn question_count_beyond_data_is_a_count_mismatch() {
        let mut packet = query_packet(9, "example.com", TYPE_A);
        packet[5] = 3;

        let err = DnsMessage::parse(&packet).unwrap_err();

        assert_eq!(
            err,
            ParseError::RecordCountMismatch {
                section: "question",
                expected: 3,
                found: 1,
            }
        );
    }

    #[test]
    fn answer_count_beyond_data_is_a_count_mismatch() {
        let mut packet = a_response_packet(9, "example.com", &[Ipv4Addr::LOCALHOST]);
        packet[7] = 2;

        let err = DnsMessage::parse(&packet).unwrap_err();

        assert_eq!(err.kind(), crate::error::ParseErrorKind::RecordCountMismatch);
    }

    #[test]
    fn label_overrunning_buffer_is_truncated() {
        let mut packet = vec![0, 1, 0, 0, 0, 1, 0, 0, 0, 0, 0, 0];
        packet.extend_from_slice(&[20, b'a', b'b']);

        let err = DnsMessage::parse(&packet).unwrap_err();

        assert!(matches!(err, ParseError::Truncated { .. }));
    }

    #[test]
    fn rdata_overrunning_buffer_is_truncated() {
        let mut packet = a_response_packet(9, "example.com", &[Ipv4Addr::LOCALHOST]);
        packet.truncate(packet.len() - 2);

        let err = DnsMessage::parse(&packet).unwrap_err();

        assert!(matches!(err, ParseError::Truncated { .. }));
    }

    #[test]
    fn overlong_name_is_malformed() {
        let mut packet = vec![0, 1, 0, 0, 0, 1, 0, 0, 0, 0, 0, 0];
        for _ in 0..5 {
            packet.push(63);
            packet.extend(std::iter::repeat_n(b'a', 63));
        }
        packet.extend_from_slice(&[0, 0, 1, 0, 1]);

        let err = DnsMessage::parse(&packet).unwrap_err();

        assert!(matches!(err, ParseError::MalformedName { .. }));
    }

    #[test]
    fn reserved_label_type_is_malformed() {
        let mut packet = vec![0, 1, 0, 0, 0, 1, 0, 0, 0, 0, 0, 0];
        packet.extend_from_slice(&[0x40, 0, 0, 1, 0, 1]);

        let err = DnsMessage::parse(&packet).unwrap_err();

        assert!(matches!(err, ParseError::MalformedName { .. }));
    }

    #[test]
    fn label_bytes_are_escaped() {
        let mut packet = vec![0, 1, 0, 0, 0, 1, 0, 0, 0, 0, 0, 0];
        packet.extend_from_slice(&[3, b'a', b'.', 0x07, 0, 0, 1, 0, 1]);

        let message = DnsMessage::parse(&packet).unwrap();

        assert_eq!(message.questions[0].name, "a\\.\\007");
    }

    #[test]
    fn escaped_labels_survive_re_encoding() {
        let mut packet = vec![0, 1, 0, 0, 0, 1, 0, 0, 0, 0, 0, 0];
        packet.extend_from_slice(&[3, b'a', b' ', b'b', 3, b'x', b'.', b'y', 2, b'\\', 0x07, 0]);
        packet.extend_from_slice(&[0, 1, 0, 1]);

        let first = DnsMessage::parse(&packet).unwrap();
        let encoded = first.to_bytes();
        let second = DnsMessage::parse(&encoded).unwrap();

        assert_eq!(first.questions[0].name, "a\\032b.x\\.y.\\\\\\007");
        assert_eq!(encoded, packet);
        assert_eq!(second, first);
    }

    #[test]
    fn blocked_response_keeps_escaped_question_name() {
        let mut packet = vec![0, 9, 1, 0, 0, 1, 0, 0, 0, 0, 0, 0];
        packet.extend_from_slice(&[5, b'a', b'd', b'.', b'e', b'x', 3, b'c', b'o', b'm', 0]);
        packet.extend_from_slice(&[0, 1, 0, 1]);
        let query = DnsMessage::parse(&packet).unwrap();

        let response = DnsMessage::parse(&query.blocked_response().to_bytes()).unwrap();

        assert_eq!(response.questions[0].name, query.questions[0].name);
        assert_eq!(response.answers[0].name, "ad\\.ex.com");
    }

    #[test]
    fn oversized_labels_are_cut_to_fit() {
        let long_label = "a".repeat(80);
        let long_name = vec!["b".repeat(60); 6].join(".");
        let message = DnsMessage::parse(&query_packet(1, &long_label, TYPE_A)).unwrap();
        let capped = DnsMessage::parse(&query_packet(2, &long_name, TYPE_A)).unwrap();

        assert_eq!(message.questions[0].name, "a".repeat(63));
        assert_eq!(capped.questions[0].name, vec!["b".repeat(60); 4].join("."));
    }

    #[test]
    fn name_overrunning_rdlength_is_malformed() {
        let mut packet = query_packet(3, "example.com", TYPE_A);
        packet[2] = 0x81;
        packet[7] = 1;
        packet.extend_from_slice(&[0xC0, 0x0C]);
        packet.extend_from_slice(&TYPE_CNAME.to_be_bytes());
        packet.extend_from_slice(&CLASS_IN.to_be_bytes());
        packet.extend_from_slice(&60u32.to_be_bytes());
        packet.extend_from_slice(&2u16.to_be_bytes());
        packet.extend_from_slice(&[3, b'f', b'o', b'o', 0]);

        let err = DnsMessage::parse(&packet).unwrap_err();

        assert!(matches!(
            err,
            ParseError::MalformedName {
                reason: "name overruns record data",
                ..
            }
        ));
    }

    #[test]
    fn random_corruption_never_panics() {
        use rand::{Rng, SeedableRng, rngs::StdRng};

        let mut rng = StdRng::seed_from_u64(0x5EED);
        let base = sample_message().to_bytes();
        for _ in 0..2000 {
            let mut packet = base.clone();
            for _ in 0..rng.random_range(1..8) {
                let i = rng.random_range(0..packet.len());
                packet[i] = rng.random();
            }
            packet.truncate(rng.random_range(0..=packet.len()));
            let _ = DnsMessage::parse(&packet);
        }
    }

    #[test]
    fn blocked_response_sinkholes_address_queries() {
        let query = DnsMessage::parse(&query_packet(42, "ads.example", TYPE_AAAA)).unwrap();

        let response = DnsMessage::parse(&query.blocked_response().to_bytes()).unwrap();

        assert_eq!(response.header.id, 42);
        assert!(response.header.is_response());
        assert_eq!(response.header.rcode(), RCODE_NOERROR);
        assert_eq!(response.answers[0].data, RData::Aaaa(Ipv6Addr::UNSPECIFIED));
    }

    #[test]
    fn blocked_response_is_nxdomain_for_other_types() {
        let query = DnsMessage::parse(&query_packet(42, "ads.example", 16)).unwrap();

        let response = query.blocked_response();

        assert_eq!(response.header.rcode(), RCODE_NXDOMAIN);
        assert!(response.answers.is_empty());
        assert_eq!(response.header.flags & FLAG_RD, FLAG_RD);
    }

    #[test]
    fn type_name_falls_back_to_number() {
        assert_eq!(type_name(TYPE_AAAA), "AAAA");
        assert_eq!(type_name(999), "TYPE999");
    }
}
