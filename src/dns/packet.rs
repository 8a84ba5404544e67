use std::net::Ipv4Addr;

use crate::dns::types::{RecordType, ResponseCode};

// Minimal RFC 1035 codec: enough to send an A query and read the answer.

const HEADER_LEN: usize = 12;
const CLASS_IN: u16 = 1;
const MAX_POINTER_JUMPS: usize = 10;
const MAX_LABEL_LEN: usize = 63;
const MAX_NAME_LEN: usize = 255;

#[derive(Debug, Clone)]
pub struct DnsHeader {
    pub id: u16,
    pub qr: bool,
    pub tc: bool,
    pub rcode: ResponseCode,
    pub qdcount: u16,
    pub ancount: u16,
}

#[derive(Debug, Clone)]
pub struct DnsRecord {
    pub name: String,
    pub rtype: RecordType,
    pub rclass: u16,
    pub ttl: u32,
    pub rdata: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct DnsResponse {
    pub header: DnsHeader,
    pub answers: Vec<DnsRecord>,
}

impl DnsResponse {
    /// IPv4 addresses carried by A records in the answer section, in wire order
    pub fn a_records(&self) -> Vec<Ipv4Addr> {
        let mut out = Vec::new();
        for record in &self.answers {
            if record.rtype != RecordType::A || record.rclass != CLASS_IN || record.rdata.len() != 4 {
                continue;
            }
            let ip = Ipv4Addr::new(record.rdata[0], record.rdata[1], record.rdata[2], record.rdata[3]);
            if !out.contains(&ip) {
                out.push(ip);
            }
        }
        out
    }
}

/// Parse a DNS name with label compression support (RFC 1035 §4.1.4)
pub fn parse_name(data: &[u8], offset: &mut usize) -> anyhow::Result<String> {
    let mut labels = Vec::new();
    let mut pos = *offset;
    let mut jumped = false;
    let mut jumps = 0;

    loop {
        let len_byte = *data
            .get(pos)
            .ok_or_else(|| anyhow::anyhow!("DNS name parse: unexpected end of data at offset {}", pos))?;

        if len_byte & 0xC0 == 0xC0 {
            let low = *data
                .get(pos + 1)
                .ok_or_else(|| anyhow::anyhow!("DNS name parse: truncated pointer at offset {}", pos))?;
            if !jumped {
                *offset = pos + 2;
                jumped = true;
            }
            jumps += 1;
            if jumps > MAX_POINTER_JUMPS {
                return Err(anyhow::anyhow!("DNS name parse: too many jumps (possible loop)"));
            }
            pos = (((len_byte as usize) & 0x3F) << 8) | low as usize;
            continue;
        }

        if len_byte == 0 {
            if !jumped {
                *offset = pos + 1;
            }
            break;
        }

        let start = pos + 1;
        let end = start + len_byte as usize;
        if end > data.len() {
            return Err(anyhow::anyhow!("DNS name parse: label extends beyond packet"));
        }
        labels.push(String::from_utf8_lossy(&data[start..end]).to_string());
        pos = end;
    }

    Ok(labels.join("."))
}

fn read_u16(data: &[u8], at: usize) -> anyhow::Result<u16> {
    data.get(at..at + 2)
        .map(|b| u16::from_be_bytes([b[0], b[1]]))
        .ok_or_else(|| anyhow::anyhow!("DNS packet truncated at offset {}", at))
}

fn read_u32(data: &[u8], at: usize) -> anyhow::Result<u32> {
    data.get(at..at + 4)
        .map(|b| u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
        .ok_or_else(|| anyhow::anyhow!("DNS packet truncated at offset {}", at))
}

/// Parse a response: header, skip questions, collect answer records.
/// Authority and additional sections are not needed and are left unread.
pub fn parse_response(data: &[u8]) -> anyhow::Result<DnsResponse> {
    if data.len() < HEADER_LEN {
        return Err(anyhow::anyhow!("DNS packet too short: {} bytes (minimum 12)", data.len()));
    }

    let flags = read_u16(data, 2)?;
    let header = DnsHeader {
        id: read_u16(data, 0)?,
        qr: (flags >> 15) & 1 == 1,
        tc: (flags >> 9) & 1 == 1,
        rcode: ResponseCode::from((flags & 0xF) as u8),
        qdcount: read_u16(data, 4)?,
        ancount: read_u16(data, 6)?,
    };

    let mut offset = HEADER_LEN;
    for _ in 0..header.qdcount {
        parse_name(data, &mut offset)?;
        offset += 4;
    }

    let mut answers = Vec::with_capacity(header.ancount as usize);
    for _ in 0..header.ancount {
        let name = parse_name(data, &mut offset)?;
        let rtype = RecordType::from(read_u16(data, offset)?);
        let rclass = read_u16(data, offset + 2)?;
        let ttl = read_u32(data, offset + 4)?;
        let rdlength = read_u16(data, offset + 8)? as usize;
        offset += 10;
        let rdata = data
            .get(offset..offset + rdlength)
            .ok_or_else(|| anyhow::anyhow!("DNS rdata extends beyond packet"))?
            .to_vec();
        offset += rdlength;
        answers.push(DnsRecord { name, rtype, rclass, ttl, rdata });
    }

    Ok(DnsResponse { header, answers })
}

/// Encode a DNS name into wire format
pub fn encode_name(name: &str) -> anyhow::Result<Vec<u8>> {
    let mut result = Vec::with_capacity(name.len() + 2);
    for label in name.trim_end_matches('.').split('.').filter(|l| !l.is_empty()) {
        if label.len() > MAX_LABEL_LEN {
            return Err(anyhow::anyhow!(
                "DNS name encode: label of {} bytes in '{}' (maximum {})",
                label.len(),
                name,
                MAX_LABEL_LEN
            ));
        }
        result.push(label.len() as u8);
        result.extend_from_slice(label.as_bytes());
    }
    result.push(0);
    if result.len() > MAX_NAME_LEN {
        return Err(anyhow::anyhow!("DNS name encode: '{}' longer than {} bytes", name, MAX_NAME_LEN));
    }
    Ok(result)
}

/// Build a single-question query with RD set
pub fn build_query(id: u16, name: &str, qtype: RecordType) -> anyhow::Result<Vec<u8>> {
    let mut packet = Vec::with_capacity(HEADER_LEN + name.len() + 6);

    packet.extend_from_slice(&id.to_be_bytes());
    packet.extend_from_slice(&0x0100u16.to_be_bytes()); // RD=1
    packet.extend_from_slice(&1u16.to_be_bytes()); // QDCOUNT
    packet.extend_from_slice(&[0, 0, 0, 0, 0, 0]); // AN/NS/AR

    packet.extend_from_slice(&encode_name(name)?);
    packet.extend_from_slice(&qtype.to_u16().to_be_bytes());
    packet.extend_from_slice(&CLASS_IN.to_be_bytes());

    Ok(packet)
}

/// Answer to `build_query(id, name, A)` with the given addresses, using a
/// compression pointer back to the question name like real servers do.
#[cfg(test)]
pub(crate) fn fake_a_response(id: u16, name: &str, ips: &[Ipv4Addr]) -> Vec<u8> {
    let mut packet = build_query(id, name, RecordType::A).unwrap();
    packet[2] |= 0x80; // QR
    packet[6..8].copy_from_slice(&(ips.len() as u16).to_be_bytes());
    for ip in ips {
        packet.extend_from_slice(&[0xC0, 0x0C]);
        packet.extend_from_slice(&1u16.to_be_bytes());
        packet.extend_from_slice(&CLASS_IN.to_be_bytes());
        packet.extend_from_slice(&60u32.to_be_bytes());
        packet.extend_from_slice(&4u16.to_be_bytes());
        packet.extend_from_slice(&ip.octets());
    }
    packet
}
