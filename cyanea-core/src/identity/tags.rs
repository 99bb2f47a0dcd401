//! Hiding ids in plain text with the Unicode "Tags" block.
//!
//! Every printable ASCII character `c` maps to the invisible code point
//! `U+E0000 | c`, so the payload can ride along at the end of a description
//! without changing what a reader sees. The payload starts with U+E0001
//! LANGUAGE TAG, which keeps it apart from tag sequences the text already
//! holds (subdivision flags such as 🏴 + `gbeng` + cancel tag).
//!
//! See <https://en.wikipedia.org/wiki/Tags_(Unicode_block)>.

use std::fmt::Write;

use crate::error::{CyaneaError, CyaneaResult};
use crate::identity::{Aux, IdentityCodec, Recovered};

const TAG_BASE: u32 = 0xE0000;
const ID_KEY: &str = "i";
const MARKER: char = '\u{E0001}';

fn is_taghidable(c: u32) -> bool {
    c == 0x01 || (0x20..=0x7f).contains(&c)
}

fn is_tag(c: char) -> bool {
    let c = c as u32;
    c == TAG_BASE + 0x01 || (TAG_BASE + 0x20..=TAG_BASE + 0x7f).contains(&c)
}

/// Maps printable ASCII (and `0x01`) into the Tags block.
///
/// Returns `None` if `plaintext` contains anything else.
pub fn taghide(plaintext: &str) -> Option<String> {
    plaintext
        .chars()
        .map(|c| {
            let c = c as u32;
            if is_taghidable(c) {
                char::from_u32(TAG_BASE | c)
            } else {
                None
            }
        })
        .collect()
}

/// Reverses [`taghide`]; `None` if `ciphertext` has anything outside the block.
pub fn untaghide(ciphertext: &str) -> Option<String> {
    ciphertext
        .chars()
        .map(|c| {
            if is_tag(c) {
                char::from_u32(c as u32 & 0x7f)
            } else {
                None
            }
        })
        .collect()
}

/// Escapes every non-ASCII character in serialized JSON as `\uXXXX` so the
/// whole document can be taghidden.
fn escape_non_ascii(json: &str) -> String {
    let mut out = String::with_capacity(json.len());
    let mut units = [0u16; 2];
    for c in json.chars() {
        if c.is_ascii() {
            out.push(c);
        } else {
            for unit in c.encode_utf16(&mut units) {
                let _ = write!(out, "\\u{:04x}", unit);
            }
        }
    }
    out
}

/// Identity codec whose payload is an invisible string of Tags-block
/// characters, appended to a piece of visible text.
///
/// The hidden document is compact JSON: `{"i": <id>, <aux key>: <value>...}`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TagCodec;

/// Byte range of the payload in `text`: the last marker plus the tag
/// characters right after it.
fn payload_span(text: &str) -> Option<(usize, usize)> {
    let start = text.rfind(MARKER)?;
    let body = &text[start + MARKER.len_utf8()..];
    let len = body.find(|c: char| !is_tag(c)).unwrap_or(body.len());
    Some((start, start + MARKER.len_utf8() + len))
}

impl TagCodec {
    /// `text` with the payload removed. Any other tag characters stay.
    pub fn visible(text: &str) -> String {
        match payload_span(text) {
            Some((start, end)) => format!("{}{}", &text[..start], &text[end..]),
            None => text.to_string(),
        }
    }
}

impl IdentityCodec for TagCodec {
    type Payload = String;

    fn embed(&self, id: &str, aux: &Aux) -> CyaneaResult<String> {
        if aux.contains_key(ID_KEY) {
            return Err(CyaneaError::IdentityEmbed {
                id: id.to_string(),
                reason: format!("auxiliary key '{ID_KEY}' is reserved"),
            });
        }

        let mut doc = serde_json::Map::new();
        doc.insert(ID_KEY.to_string(), id.into());
        for (key, value) in aux {
            doc.insert(key.clone(), value.as_str().into());
        }

        let json = serde_json::to_string(&doc)
            .map_err(|e| CyaneaError::Serialization(e.to_string()))?;

        let hidden = taghide(&escape_non_ascii(&json)).ok_or_else(|| CyaneaError::IdentityEmbed {
            id: id.to_string(),
            reason: "payload is not taghidable".to_string(),
        })?;
        Ok(format!("{MARKER}{hidden}"))
    }

    fn extract(&self, text: &String) -> Option<Recovered> {
        let (start, end) = payload_span(text)?;
        let hidden = &text[start + MARKER.len_utf8()..end];
        if hidden.is_empty() {
            return None;
        }

        let json = untaghide(hidden)?;
        let serde_json::Value::Object(mut doc) = serde_json::from_str(&json).ok()? else {
            return None;
        };

        let id = match doc.remove(ID_KEY)? {
            serde_json::Value::String(id) => id,
            _ => return None,
        };

        let aux = doc
            .into_iter()
            .filter_map(|(key, value)| match value {
                serde_json::Value::String(value) => Some((key, value)),
                _ => None,
            })
            .collect();

        Some(Recovered { id, aux })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_taghide_roundtrip() {
        let hidden = taghide("cyanea:id=42").unwrap();

        assert!(hidden.chars().all(is_tag));
        assert_eq!(untaghide(&hidden).unwrap(), "cyanea:id=42");
    }

    #[test]
    fn test_taghide_rejects_non_ascii() {
        assert_eq!(taghide("café"), None);
        assert_eq!(untaghide("plain"), None);
    }

    #[test]
    fn test_embed_extract_roundtrip() {
        let cases: Vec<(&str, Aux)> = vec![
            ("gm-1", Aux::new()),
            (
                "workshop/2024-fall#3",
                Aux::from([("b".into(), "https://example.com/a b.png".into())]),
            ),
            (
                "éé-🦀",
                Aux::from([
                    ("b".into(), "https://例え.jp/banner".into()),
                    ("note".into(), "quote \" and \\ backslash\nnewline".into()),
                ]),
            ),
        ];

        for (id, aux) in cases {
            let payload = TagCodec.embed(id, &aux).unwrap();
            let recovered = TagCodec.extract(&payload).unwrap();
            assert_eq!(recovered, Recovered { id: id.to_string(), aux });
        }
    }

    #[test]
    fn test_extract_from_text_with_visible_content() {
        let hidden = TagCodec.embed("gm-1", &Aux::new()).unwrap();
        let description = format!("Come to our first meeting!{hidden}");

        assert_eq!(TagCodec.extract(&description).unwrap().id, "gm-1");
        assert_eq!(TagCodec::visible(&description), "Come to our first meeting!");
    }

    #[test]
    fn test_extract_ignores_foreign_text() {
        assert_eq!(TagCodec.extract(&"just a description".to_string()), None);

        let not_json = format!("text{MARKER}{}", taghide("hello").unwrap());
        assert_eq!(TagCodec.extract(&not_json), None);

        let no_id = format!("text{MARKER}{}", taghide(r#"{"b":"x"}"#).unwrap());
        assert_eq!(TagCodec.extract(&no_id), None);

        let unmarked = format!("text{}", taghide(r#"{"i":"a"}"#).unwrap());
        assert_eq!(TagCodec.extract(&unmarked), None);
    }

    const ENGLAND: &str = "🏴\u{e0067}\u{e0062}\u{e0065}\u{e006e}\u{e0067}\u{e007f}";

    #[test]
    fn test_visible_keeps_tag_sequences_in_the_text() {
        let text = format!("Go team {ENGLAND}!");

        assert_eq!(TagCodec::visible(&text), text);
        assert_eq!(TagCodec.extract(&text), None);
    }

    #[test]
    fn test_payload_after_a_flag_emoji() {
        let hidden = TagCodec.embed("a", &Aux::new()).unwrap();
        let description = format!("Go team {ENGLAND}{hidden}");

        assert_eq!(TagCodec.extract(&description).unwrap().id, "a");
        assert_eq!(TagCodec::visible(&description), format!("Go team {ENGLAND}"));
    }

    #[test]
    fn test_text_after_the_payload_is_kept() {
        let hidden = TagCodec.embed("a", &Aux::new()).unwrap();
        let description = format!("Meeting{hidden}\n");

        assert_eq!(TagCodec.extract(&description).unwrap().id, "a");
        assert_eq!(TagCodec::visible(&description), "Meeting\n");
    }

    #[test]
    fn test_reserved_aux_key() {
        let aux = Aux::from([("i".into(), "other".into())]);

        assert!(TagCodec.embed("gm-1", &aux).is_err());
    }
}
