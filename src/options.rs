use std::collections::HashMap;
use std::net::Ipv4Addr;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Well-known option codes the server itself emits or inspects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum OptionCode {
    Pad = 0,
    SubnetMask = 1,
    BroadcastAddress = 28,
    RequestedIpAddress = 50,
    LeaseTime = 51,
    MessageType = 53,
    ServerIdentifier = 54,
    RenewalTime = 58,
    RebindingTime = 59,
    End = 255,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageType {
    Discover = 1,
    Offer = 2,
    Request = 3,
    Decline = 4,
    Ack = 5,
    Nak = 6,
    Release = 7,
    Inform = 8,
}

impl TryFrom<u8> for MessageType {
    type Error = u8;

    fn try_from(value: u8) -> std::result::Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::Discover),
            2 => Ok(Self::Offer),
            3 => Ok(Self::Request),
            4 => Ok(Self::Decline),
            5 => Ok(Self::Ack),
            6 => Ok(Self::Nak),
            7 => Ok(Self::Release),
            8 => Ok(Self::Inform),
            other => Err(other),
        }
    }
}

impl std::fmt::Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Discover => write!(f, "DISCOVER"),
            Self::Offer => write!(f, "OFFER"),
            Self::Request => write!(f, "REQUEST"),
            Self::Decline => write!(f, "DECLINE"),
            Self::Ack => write!(f, "ACK"),
            Self::Nak => write!(f, "NAK"),
            Self::Release => write!(f, "RELEASE"),
            Self::Inform => write!(f, "INFORM"),
        }
    }
}

/// Canonical wire type of an option payload, per RFC 2132.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OptionKind {
    Ip,
    IpList,
    U32,
    U16,
    U8,
    Bool,
    Text,
}

fn option_kind(code: u8) -> OptionKind {
    match code {
        1 | 16 | 28 | 32 | 50 | 54 => OptionKind::Ip,
        3..=11 | 41 | 42 | 44 | 45 | 48 | 49 | 65 | 69..=76 => OptionKind::IpList,
        2 | 24 | 35 | 38 | 51 | 58 | 59 => OptionKind::U32,
        13 | 22 | 26 | 57 => OptionKind::U16,
        23 | 37 | 46 | 52 | 53 => OptionKind::U8,
        19 | 20 | 27 | 29 | 30 | 31 | 34 | 36 | 39 => OptionKind::Bool,
        _ => OptionKind::Text,
    }
}

/// Converts rendered template text to the option's raw wire payload.
pub fn encode_option_value(code: u8, text: &str) -> Result<Vec<u8>> {
    let fail = |message: String| Error::OptionRender(code, message);

    match option_kind(code) {
        OptionKind::Ip => {
            let ip: Ipv4Addr = text
                .trim()
                .parse()
                .map_err(|_| fail(format!("{text:?} is not an IPv4 address")))?;
            Ok(ip.octets().to_vec())
        }
        OptionKind::IpList => {
            let mut bytes = Vec::new();
            for part in text.split([',', ' ']).filter(|part| !part.is_empty()) {
                let ip: Ipv4Addr = part
                    .trim()
                    .parse()
                    .map_err(|_| fail(format!("{part:?} is not an IPv4 address")))?;
                bytes.extend_from_slice(&ip.octets());
            }
            if bytes.is_empty() {
                return Err(fail("empty address list".to_string()));
            }
            Ok(bytes)
        }
        OptionKind::U32 => {
            let value: u32 = text
                .trim()
                .parse()
                .map_err(|_| fail(format!("{text:?} is not a u32")))?;
            Ok(value.to_be_bytes().to_vec())
        }
        OptionKind::U16 => {
            let value: u16 = text
                .trim()
                .parse()
                .map_err(|_| fail(format!("{text:?} is not a u16")))?;
            Ok(value.to_be_bytes().to_vec())
        }
        OptionKind::U8 => {
            let value: u8 = text
                .trim()
                .parse()
                .map_err(|_| fail(format!("{text:?} is not a u8")))?;
            Ok(vec![value])
        }
        OptionKind::Bool => match text.trim() {
            "true" => Ok(vec![1]),
            "false" => Ok(vec![0]),
            other => Err(fail(format!("{other:?} is not true/false"))),
        },
        OptionKind::Text => Ok(text.as_bytes().to_vec()),
    }
}

/// Decodes a received option payload to the textual form templates consume.
///
/// Malformed payloads degrade to a lossy string rather than failing; the
/// client sent them, and templates that do not reference them never notice.
pub fn decode_option_value(code: u8, data: &[u8]) -> String {
    match option_kind(code) {
        OptionKind::Ip if data.len() == 4 => {
            Ipv4Addr::new(data[0], data[1], data[2], data[3]).to_string()
        }
        OptionKind::IpList if data.len() % 4 == 0 && !data.is_empty() => data
            .chunks_exact(4)
            .map(|chunk| Ipv4Addr::new(chunk[0], chunk[1], chunk[2], chunk[3]).to_string())
            .collect::<Vec<_>>()
            .join(","),
        OptionKind::U32 if data.len() == 4 => {
            u32::from_be_bytes([data[0], data[1], data[2], data[3]]).to_string()
        }
        OptionKind::U16 if data.len() == 2 => u16::from_be_bytes([data[0], data[1]]).to_string(),
        OptionKind::U8 if data.len() == 1 => data[0].to_string(),
        OptionKind::Bool if data.len() == 1 => {
            if data[0] == 0 { "false" } else { "true" }.to_string()
        }
        _ => String::from_utf8_lossy(data).to_string(),
    }
}

/// A templated DHCP option attached to a subnet or a binding.
///
/// `value` is rendered against the inbound packet's options before being
/// converted to wire bytes: `{{NN}}` substitutes the decoded string of the
/// client's option `NN`, everything else is literal text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OptionTemplate {
    #[serde(rename = "id")]
    pub code: u8,
    pub value: String,
}

impl OptionTemplate {
    pub fn new(code: u8, value: impl Into<String>) -> Self {
        Self {
            code,
            value: value.into(),
        }
    }

    /// Renders the template and converts the result to wire bytes.
    pub fn render(&self, src_opts: &HashMap<u8, String>) -> Result<(u8, Vec<u8>)> {
        let text = expand(&self.value, src_opts).map_err(|msg| Error::OptionRender(self.code, msg))?;
        let bytes = encode_option_value(self.code, &text)?;
        Ok((self.code, bytes))
    }
}

fn expand(
    template: &str,
    vars: &HashMap<u8, String>,
) -> std::result::Result<String, String> {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(start) = rest.find("{{") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let Some(end) = after.find("}}") else {
            return Err("unterminated placeholder".to_string());
        };
        let name = after[..end].trim();
        let code: u8 = name
            .parse()
            .map_err(|_| format!("placeholder {name:?} is not an option code"))?;
        let value = vars
            .get(&code)
            .ok_or_else(|| format!("option {code} not present in request"))?;
        out.push_str(value);
        rest = &after[end + 2..];
    }

    out.push_str(rest);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_type_roundtrip() {
        for value in 1..=8u8 {
            let msg_type = MessageType::try_from(value).unwrap();
            assert_eq!(msg_type as u8, value);
        }
        assert!(MessageType::try_from(9).is_err());
    }

    #[test]
    fn test_encode_ip_value() {
        let bytes = encode_option_value(1, "255.255.255.0").unwrap();
        assert_eq!(bytes, vec![255, 255, 255, 0]);
        assert!(encode_option_value(1, "not-an-ip").is_err());
    }

    #[test]
    fn test_encode_ip_list_value() {
        let bytes = encode_option_value(6, "8.8.8.8,8.8.4.4").unwrap();
        assert_eq!(bytes, vec![8, 8, 8, 8, 8, 8, 4, 4]);
        let bytes = encode_option_value(3, "10.0.0.1").unwrap();
        assert_eq!(bytes, vec![10, 0, 0, 1]);
        assert!(encode_option_value(6, "").is_err());
    }

    #[test]
    fn test_encode_numeric_values() {
        assert_eq!(encode_option_value(51, "3600").unwrap(), vec![0, 0, 14, 16]);
        assert_eq!(encode_option_value(26, "1500").unwrap(), vec![5, 220]);
        assert_eq!(encode_option_value(23, "64").unwrap(), vec![64]);
        assert!(encode_option_value(51, "many").is_err());
    }

    #[test]
    fn test_encode_bool_value() {
        assert_eq!(encode_option_value(19, "true").unwrap(), vec![1]);
        assert_eq!(encode_option_value(19, "false").unwrap(), vec![0]);
        assert!(encode_option_value(19, "yes").is_err());
    }

    #[test]
    fn test_unknown_code_passes_through_as_text() {
        let bytes = encode_option_value(224, "hello").unwrap();
        assert_eq!(bytes, b"hello".to_vec());
    }

    #[test]
    fn test_decode_values() {
        assert_eq!(decode_option_value(1, &[255, 255, 0, 0]), "255.255.0.0");
        assert_eq!(decode_option_value(6, &[8, 8, 8, 8, 1, 1, 1, 1]), "8.8.8.8,1.1.1.1");
        assert_eq!(decode_option_value(51, &[0, 0, 14, 16]), "3600");
        assert_eq!(decode_option_value(26, &[5, 220]), "1500");
        assert_eq!(decode_option_value(19, &[1]), "true");
        assert_eq!(decode_option_value(12, b"host-1"), "host-1");
    }

    #[test]
    fn test_decode_malformed_payload_degrades() {
        assert_eq!(decode_option_value(1, b"ab"), "ab");
    }

    #[test]
    fn test_encode_decode_symmetry_for_lists() {
        let text = decode_option_value(6, &[8, 8, 8, 8, 8, 8, 4, 4]);
        let bytes = encode_option_value(6, &text).unwrap();
        assert_eq!(bytes, vec![8, 8, 8, 8, 8, 8, 4, 4]);
    }

    #[test]
    fn test_render_literal_template() {
        let option = OptionTemplate::new(3, "10.0.0.1");
        let (code, bytes) = option.render(&HashMap::new()).unwrap();
        assert_eq!(code, 3);
        assert_eq!(bytes, vec![10, 0, 0, 1]);
    }

    #[test]
    fn test_render_substitutes_client_option() {
        let mut src = HashMap::new();
        src.insert(12u8, "node-7".to_string());
        let option = OptionTemplate::new(67, "/boot/{{12}}.ipxe");
        let (_, bytes) = option.render(&src).unwrap();
        assert_eq!(bytes, b"/boot/node-7.ipxe".to_vec());
    }

    #[test]
    fn test_render_missing_variable_fails() {
        let option = OptionTemplate::new(67, "/boot/{{12}}.ipxe");
        let result = option.render(&HashMap::new());
        assert!(matches!(result, Err(Error::OptionRender(67, _))));
    }

    #[test]
    fn test_render_unterminated_placeholder_fails() {
        let option = OptionTemplate::new(67, "/boot/{{12.ipxe");
        assert!(option.render(&HashMap::new()).is_err());
    }

    #[test]
    fn test_render_bad_placeholder_name_fails() {
        let option = OptionTemplate::new(67, "{{hostname}}");
        assert!(option.render(&HashMap::new()).is_err());
    }

    #[test]
    fn test_render_result_must_parse_for_typed_codes() {
        let mut src = HashMap::new();
        src.insert(12u8, "not-an-ip".to_string());
        let option = OptionTemplate::new(3, "{{12}}");
        assert!(option.render(&src).is_err());
    }

    #[test]
    fn test_template_json_shape() {
        let option = OptionTemplate::new(6, "8.8.8.8");
        let json = serde_json::to_string(&option).unwrap();
        assert_eq!(json, r#"{"id":6,"value":"8.8.8.8"}"#);
        let back: OptionTemplate = serde_json::from_str(&json).unwrap();
        assert_eq!(back, option);
    }
}
