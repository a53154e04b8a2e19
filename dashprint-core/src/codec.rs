//! Pure, stateless helpers for the Marlin-style line protocol: checksums, line
//! framing, and parsing of the firmware's reply grammar.

use std::collections::HashMap;

use winnow::{
    ascii::{dec_uint, space0},
    combinator::{alt, eof, preceded, rest},
    prelude::*,
    token::one_of,
};

/// The sequence number resets before it would overflow a firmware's 16-bit
/// counter in practice; Marlin accepts anything up to `i32::MAX` but dashprint
/// keeps headroom and rolls over well before that, per the protocol spec.
pub const MAX_LINE_NO: u32 = 10_000;

/// 8-bit XOR checksum of every byte in `line`, as Marlin's `M110`/`Nxxx` line
/// protocol defines it.
pub fn checksum(line: &str) -> u8 {
    line.bytes().fold(0u8, |acc, b| acc ^ b)
}

/// Frame `cmd` as `N<n> <cmd> *<checksum>\n`. The checksum covers the prefix
/// up to (not including) the `*` or the trailing newline.
pub fn frame(n: u32, cmd: &str) -> String {
    let prefix = format!("N{n} {cmd}");
    let csum = checksum(&prefix);
    format!("{prefix} *{csum}\n")
}

/// Extracts `key:value` pairs from a firmware info line such as
/// `FIRMWARE_NAME:Marlin 1.1 SOURCE_CODE_URL:https://example PROTOCOL_VERSION:1.0`.
///
/// A key is a maximal run of non-whitespace bytes ending right before a `:`.
/// Its value runs until the next key's starting position or end-of-line. Keys
/// that themselves contain a `:` (for example inside a URL value) are never
/// mistaken for new keys because the scan only considers token starts that
/// immediately follow whitespace.
pub fn kv_parse(line: &str) -> HashMap<String, String> {
    let mut out = HashMap::new();
    let tokens = find_key_starts(line);
    for (i, &(key_start, key_end)) in tokens.iter().enumerate() {
        let value_start = key_end + 1; // skip ':'
        let value_end = tokens
            .get(i + 1)
            .map(|&(next_start, _)| next_start)
            .unwrap_or(line.len());
        let key = line[key_start..key_end].to_string();
        let value = line[value_start..value_end].trim().to_string();
        out.insert(key, value);
    }
    out
}

/// Finds every `(start, end)` byte range of a candidate key: a maximal run of
/// non-whitespace immediately preceding a `:`, where the run's start is either
/// the start of the line or immediately after whitespace.
fn find_key_starts(line: &str) -> Vec<(usize, usize)> {
    let bytes = line.as_bytes();
    let mut starts = Vec::new();
    let mut token_start: Option<usize> = None;
    for (i, &b) in bytes.iter().enumerate() {
        if b.is_ascii_whitespace() {
            token_start = None;
            continue;
        }
        if token_start.is_none() {
            token_start = Some(i);
        }
        if b == b':' {
            if let Some(start) = token_start {
                if start < i {
                    starts.push((start, i));
                }
            }
            token_start = None;
        }
    }
    starts
}

/// One parsed reply line from the firmware.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reply {
    /// A bare `ok` or `ok <trailer>` line.
    Ok,
    /// `Resend:<n>` — the firmware wants line `n` retransmitted.
    Resend(u32),
}

fn ok_reply(input: &mut &[u8]) -> PResult<Reply> {
    (space0, "ok").parse_next(input)?;
    // "ok" must stand alone or be followed by a separator, so "okay" never
    // parses as an ok reply.
    alt((eof.void(), one_of([b' ', b'\t', b':', b'\r', b'\n']).void())).parse_next(input)?;
    rest.void().parse_next(input)?;
    Ok(Reply::Ok)
}

fn resend_reply(input: &mut &[u8]) -> PResult<Reply> {
    let n = preceded((space0, "Resend:", space0), dec_uint).parse_next(input)?;
    Ok(Reply::Resend(n))
}

/// Parses one line against the reply grammar (`ok`/`ok ...`/`Resend:<n>`).
/// Lines matching neither are not replies at all — they are data lines to be
/// accumulated and handed back to the caller verbatim.
pub fn parse_reply(line: &[u8]) -> Option<Reply> {
    alt((ok_reply, resend_reply)).parse(line).ok()
}

/// True for a line that is exactly `"start"`, which firmwares print once on
/// power-up or reset.
pub fn is_restart_banner(line: &str) -> bool {
    line.trim_end_matches(['\r', '\n']) == "start"
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checksum_matches_known_value() {
        assert_eq!(checksum("N1 M115"), 39);
    }

    #[test]
    fn checksum_is_xor_of_bytes() {
        let s = "N42 G1 X10 Y20 *0";
        let expected = s.bytes().fold(0u8, |a, b| a ^ b);
        assert_eq!(checksum(s), expected);
    }

    #[test]
    fn frame_round_trip() {
        let framed = frame(7, "M104 S200");
        let prefix = "N7 M104 S200";
        let csum = checksum(prefix);
        assert_eq!(framed, format!("{prefix} *{csum}\n"));
    }

    #[test]
    fn kv_parse_basic() {
        let map = kv_parse("FIRMWARE_NAME:Marlin 1.0 PROTOCOL_VERSION:1.0");
        assert_eq!(map.get("FIRMWARE_NAME").unwrap(), "Marlin 1.0");
        assert_eq!(map.get("PROTOCOL_VERSION").unwrap(), "1.0");
    }

    #[test]
    fn kv_parse_value_with_colon_is_not_misread_as_key() {
        let map = kv_parse("SOURCE_CODE_URL:https://example.com/a:b EXTRUDER_COUNT:1");
        assert_eq!(
            map.get("SOURCE_CODE_URL").unwrap(),
            "https://example.com/a:b"
        );
        assert_eq!(map.get("EXTRUDER_COUNT").unwrap(), "1");
    }

    #[test]
    fn parse_reply_ok_variants() {
        assert_eq!(parse_reply(b"ok"), Some(Reply::Ok));
        assert_eq!(parse_reply(b"ok N5 P15 B3"), Some(Reply::Ok));
        assert_eq!(parse_reply(b"ok\n"), Some(Reply::Ok));
    }

    #[test]
    fn parse_reply_resend() {
        assert_eq!(parse_reply(b"Resend:5\n"), Some(Reply::Resend(5)));
        assert_eq!(parse_reply(b"Resend: 12"), Some(Reply::Resend(12)));
    }

    #[test]
    fn parse_reply_data_line_is_neither() {
        assert_eq!(parse_reply(b"T:200.1 /200.0 B:60.0 /60.0"), None);
    }

    #[test]
    fn parse_reply_does_not_match_word_starting_with_ok() {
        assert_eq!(parse_reply(b"okay"), None);
    }

    #[test]
    fn restart_banner_detection() {
        assert!(is_restart_banner("start"));
        assert!(is_restart_banner("start\n"));
        assert!(!is_restart_banner("started"));
    }
}
