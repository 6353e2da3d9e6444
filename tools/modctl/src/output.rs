//! Hex rendering of response payloads

use modstack::pdu::pack_bits;

/// Registers as big-endian words, e.g. `[1, 0xABCD]` -> `0001abcd`
pub fn registers_hex(values: &[u16]) -> String {
    let bytes: Vec<u8> = values.iter().flat_map(|value| value.to_be_bytes()).collect();
    hex::encode(bytes)
}

/// Coils packed as on the wire, first coil in the low bit of the first byte
pub fn coils_hex(values: &[bool]) -> String {
    hex::encode(pack_bits(values))
}

/// Decimal or `0x`-prefixed hexadecimal 16-bit value
pub fn parse_u16(text: &str) -> Result<u16, String> {
    let parsed = match text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
        Some(digits) => u16::from_str_radix(digits, 16),
        None => text.parse::<u16>(),
    };
    parsed.map_err(|e| format!("'{}' is not a 16-bit value: {}", text, e))
}

/// `on`/`off`, `true`/`false` or `1`/`0`
pub fn parse_coil(text: &str) -> Result<bool, String> {
    match text.to_ascii_lowercase().as_str() {
        "on" | "true" | "1" => Ok(true),
        "off" | "false" | "0" => Ok(false),
        _ => Err(format!("'{}' is not a coil state (on/off)", text)),
    }
}
