//! Binary-mode escape table.
//!
//! Binary file data travels raw through the terminal, so the bytes that
//! terminals, shells and tmux react to are replaced with two-byte
//! sequences drawn from a printable alphabet. The table itself is
//! negotiated inside the CFG frame; both peers apply whatever table the
//! server sent, so the concrete values only need to be self-consistent.

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::{Result, TrzszError};

/// Lead byte of every escape pair; it is always the first table entry,
/// mapped to a doubled lead.
pub const ESCAPE_LEAD: u8 = 0xEE;

/// Ordered `(original, [lead, code])` substitutions.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct EscapeTable {
    entries: Vec<(u8, [u8; 2])>,
}

impl EscapeTable {
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    fn encode_map(&self) -> [Option<[u8; 2]>; 256] {
        let mut map = [None; 256];
        for &(orig, pair) in &self.entries {
            map[orig as usize] = Some(pair);
        }
        map
    }

    fn decode_map(&self) -> [Option<u8>; 256] {
        let mut map = [None; 256];
        for &(orig, pair) in &self.entries {
            map[pair[1] as usize] = Some(orig);
        }
        map
    }

    fn lead(&self) -> Option<u8> {
        self.entries.first().map(|(_, pair)| pair[0])
    }
}

/// Build the negotiated table. The minimum covers STX and the lead byte
/// itself; `escape_all` extends it to every byte known to upset a
/// terminal: C0 controls, DEL + C1 controls, `!`, `#` and `$`.
pub fn escape_table(escape_all: bool) -> EscapeTable {
    let mut entries = vec![(ESCAPE_LEAD, [ESCAPE_LEAD, ESCAPE_LEAD])];
    if !escape_all {
        entries.push((0x02, [ESCAPE_LEAD, code_for_c0(0x02)]));
        return EscapeTable { entries };
    }
    for orig in 0x00..=0x1Fu8 {
        entries.push((orig, [ESCAPE_LEAD, code_for_c0(orig)]));
    }
    for (i, orig) in (0x7F..=0x9Fu8).enumerate() {
        let code = match i {
            0..=19 => b'g' + i as u8,
            20..=29 => b'0' + (i as u8 - 20),
            _ => [b'+', b'/', b'='][i - 30],
        };
        entries.push((orig, [ESCAPE_LEAD, code]));
    }
    for (orig, code) in [(b'!', b'%'), (b'#', b'^'), (b'$', b'&')] {
        entries.push((orig, [ESCAPE_LEAD, code]));
    }
    EscapeTable { entries }
}

fn code_for_c0(orig: u8) -> u8 {
    if orig < 26 {
        b'A' + orig
    } else {
        b'a' + (orig - 26)
    }
}

/// Replace every table byte with its two-byte sequence.
pub fn escape_data(data: &[u8], table: &EscapeTable) -> Vec<u8> {
    if table.is_empty() {
        return data.to_vec();
    }
    let map = table.encode_map();
    let mut out = Vec::with_capacity(data.len() * 2);
    for &b in data {
        match map[b as usize] {
            Some(pair) => out.extend_from_slice(&pair),
            None => out.push(b),
        }
    }
    out
}

/// Reverse of [`escape_data`]. A lead byte followed by an unknown code,
/// or a lead cut off at the end of the buffer, is a decode failure.
pub fn unescape_data(data: &[u8], table: &EscapeTable) -> Result<Vec<u8>> {
    if table.is_empty() {
        return Ok(data.to_vec());
    }
    let lead = match table.lead() {
        Some(lead) => lead,
        None => return Ok(data.to_vec()),
    };
    let map = table.decode_map();
    let mut out = Vec::with_capacity(data.len());
    let mut idx = 0;
    while idx < data.len() {
        let b = data[idx];
        if b != lead {
            out.push(b);
            idx += 1;
            continue;
        }
        let code = *data
            .get(idx + 1)
            .ok_or_else(|| TrzszError::traced("Binary decode: truncated escape sequence"))?;
        match map[code as usize] {
            Some(orig) => out.push(orig),
            None => {
                return Err(TrzszError::traced(format!(
                    "Binary decode: unknown escape code {:#04x}",
                    code
                )))
            }
        }
        idx += 2;
    }
    Ok(out)
}

// On the wire the table is an array of two-element string arrays, each
// character's code point standing for one byte.
impl Serialize for EscapeTable {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let pairs: Vec<[String; 2]> = self
            .entries
            .iter()
            .map(|&(orig, pair)| {
                [
                    char::from(orig).to_string(),
                    pair.iter().map(|&b| char::from(b)).collect(),
                ]
            })
            .collect();
        pairs.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for EscapeTable {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let pairs = Vec::<[String; 2]>::deserialize(deserializer)?;
        let mut entries = Vec::with_capacity(pairs.len());
        for [orig, replacement] in pairs {
            let orig = single_byte(&orig)
                .ok_or_else(|| D::Error::custom(format!("bad escape original: {:?}", orig)))?;
            let codes: Option<Vec<u8>> = replacement.chars().map(char_byte).collect();
            let pair = match codes.as_deref() {
                Some(&[lead, code]) => [lead, code],
                _ => {
                    return Err(D::Error::custom(format!(
                        "bad escape replacement: {:?}",
                        replacement
                    )))
                }
            };
            entries.push((orig, pair));
        }
        Ok(EscapeTable { entries })
    }
}

fn single_byte(s: &str) -> Option<u8> {
    let mut chars = s.chars();
    let b = char_byte(chars.next()?)?;
    chars.next().is_none().then_some(b)
}

fn char_byte(c: char) -> Option<u8> {
    u8::try_from(u32::from(c)).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_arbitrary_bytes() {
        let all: Vec<u8> = (0u8..=255).cycle().take(2048).collect();
        for escape_all in [false, true] {
            let table = escape_table(escape_all);
            let escaped = escape_data(&all, &table);
            assert_eq!(unescape_data(&escaped, &table).unwrap(), all);
        }
    }

    #[test]
    fn full_table_hides_control_bytes() {
        let table = escape_table(true);
        let hairy: Vec<u8> = (0x00..=0x1F)
            .chain(0x7F..=0x9F)
            .chain([b'!', b'#', b'$', ESCAPE_LEAD])
            .collect();
        let escaped = escape_data(&hairy, &table);
        assert!(escaped
            .iter()
            .all(|&b| b == ESCAPE_LEAD || (0x20..0x7F).contains(&b)));
    }

    #[test]
    fn lead_is_first_and_doubled() {
        for escape_all in [false, true] {
            let table = escape_table(escape_all);
            assert_eq!(table.entries[0], (ESCAPE_LEAD, [ESCAPE_LEAD, ESCAPE_LEAD]));
            assert!(table.entries.iter().any(|&(orig, _)| orig == 0x02));
        }
    }

    #[test]
    fn replacement_codes_are_unique() {
        let table = escape_table(true);
        let mut seen = std::collections::HashSet::new();
        for &(_, pair) in &table.entries {
            assert!(seen.insert(pair[1]), "duplicate code {:#04x}", pair[1]);
        }
    }

    #[test]
    fn unknown_code_is_rejected() {
        let table = escape_table(false);
        assert!(unescape_data(&[ESCAPE_LEAD, b'?'], &table).is_err());
        assert!(unescape_data(&[b'x', ESCAPE_LEAD], &table).is_err());
    }

    #[test]
    fn json_round_trip() {
        let table = escape_table(true);
        let json = serde_json::to_string(&table).unwrap();
        let parsed: EscapeTable = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, table);
    }

    #[test]
    fn empty_table_is_identity() {
        let table = EscapeTable::default();
        let data = b"\x02\xee raw".to_vec();
        assert_eq!(escape_data(&data, &table), data);
        assert_eq!(unescape_data(&data, &table).unwrap(), data);
    }
}
