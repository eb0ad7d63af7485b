//! Pattern rewriting ahead of the engine's grammar compiler.
//!
//! The compiler accepts a narrower dialect than callers tend to write:
//! it has no negated character classes and chokes on a handful of
//! separator characters. [`preprocess`] rewrites a pattern in three passes,
//! always in this order:
//!
//! 1. `\uXXXX` escapes become the literal code point.
//! 2. `\xXX` escapes become the literal character `U+00XX`.
//! 3. `[^...]` classes become positive classes over printable ASCII.
//!
//! U+2028, U+2029, VT, FF and NEL are dropped entirely when they appear as
//! escapes. Escapes that are not recognised are copied through unchanged,
//! so the function never fails.

use std::collections::BTreeSet;
use std::ops::RangeInclusive;

/// Code points removed by the `\u` pass (line and paragraph separator).
const DROPPED_CODEPOINTS: [u32; 2] = [0x2028, 0x2029];

/// Byte values removed by the `\x` pass (VT, FF, NEL).
const DROPPED_BYTES: [u32; 3] = [0x0b, 0x0c, 0x85];

/// Universe of a rewritten negated class.
const PRINTABLE_ASCII: RangeInclusive<u8> = 0x20..=0x7e;

/// Rewrite `pattern` into the dialect the constraint compiler accepts.
pub fn preprocess(pattern: &str) -> String {
    let decoded = decode_escapes(pattern, 'u', 4, |value| {
        if DROPPED_CODEPOINTS.contains(&value) {
            return Escape::Drop;
        }
        // Lone surrogates have no char representation; leave them as text.
        char::from_u32(value).map_or(Escape::Keep, Escape::Emit)
    });
    let decoded = decode_escapes(&decoded, 'x', 2, |value| {
        if DROPPED_BYTES.contains(&value) {
            return Escape::Drop;
        }
        char::from_u32(value).map_or(Escape::Keep, Escape::Emit)
    });
    rewrite_negated_classes(&decoded)
}

enum Escape {
    Emit(char),
    Drop,
    Keep,
}

/// Replace `\<marker>` followed by exactly `digits` hex digits.
///
/// Any other escape pair is copied as a unit, so `\\u0041` keeps its
/// escaped backslash and is not decoded.
fn decode_escapes(
    input: &str,
    marker: char,
    digits: usize,
    decode: impl Fn(u32) -> Escape,
) -> String {
    let chars: Vec<char> = input.chars().collect();
    let mut out = String::with_capacity(input.len());
    let mut i = 0;

    while i < chars.len() {
        if chars[i] != '\\' || i + 1 >= chars.len() {
            out.push(chars[i]);
            i += 1;
            continue;
        }

        let next = chars[i + 1];
        if next == marker {
            if let Some(value) = parse_hex(chars.get(i + 2..i + 2 + digits)) {
                match decode(value) {
                    Escape::Emit(c) => {
                        out.push(c);
                        i += 2 + digits;
                        continue;
                    }
                    Escape::Drop => {
                        i += 2 + digits;
                        continue;
                    }
                    Escape::Keep => {}
                }
            }
        }

        out.push('\\');
        out.push(next);
        i += 2;
    }

    out
}

fn parse_hex(digits: Option<&[char]>) -> Option<u32> {
    digits?
        .iter()
        .try_fold(0u32, |acc, c| c.to_digit(16).map(|d| acc * 16 + d))
}

fn rewrite_negated_classes(input: &str) -> String {
    let chars: Vec<char> = input.chars().collect();
    let mut out = String::with_capacity(input.len());
    let mut i = 0;

    while i < chars.len() {
        match chars[i] {
            // An escaped `[` is a literal, never the start of a class.
            '\\' if i + 1 < chars.len() => {
                out.push('\\');
                out.push(chars[i + 1]);
                i += 2;
            }
            '[' if chars.get(i + 1) == Some(&'^') => match class_end(&chars, i + 2) {
                Some(end) => {
                    out.push_str(&positive_class(&chars[i + 2..end]));
                    i = end + 1;
                }
                None => {
                    out.push('[');
                    i += 1;
                }
            },
            c => {
                out.push(c);
                i += 1;
            }
        }
    }

    out
}

/// Index of the `]` closing a class whose body starts at `start`.
///
/// Nested brackets are matched by depth. When they never balance, an
/// unescaped `[` in the body is a literal and the class ends at the first
/// unescaped `]`.
fn class_end(chars: &[char], start: usize) -> Option<usize> {
    let mut depth = 1usize;
    let mut first_close = None;
    let mut j = start;
    while j < chars.len() {
        match chars[j] {
            '\\' if j + 1 < chars.len() => {
                j += 2;
                continue;
            }
            '[' => depth += 1,
            ']' => {
                first_close.get_or_insert(j);
                depth -= 1;
                if depth == 0 {
                    return Some(j);
                }
            }
            _ => {}
        }
        j += 1;
    }
    first_close
}

fn positive_class(body: &[char]) -> String {
    let excluded = ExcludedSet::parse(body);
    let mut out = String::from("[");
    for c in PRINTABLE_ASCII.map(char::from) {
        if excluded.contains(c) {
            continue;
        }
        if matches!(c, '\\' | ']' | '-' | '^') {
            out.push('\\');
        }
        out.push(c);
    }
    out.push(']');
    out
}

#[derive(Debug, Default)]
struct ExcludedSet {
    chars: BTreeSet<char>,
    ranges: Vec<RangeInclusive<char>>,
}

impl ExcludedSet {
    fn parse(body: &[char]) -> Self {
        let mut set = Self::default();
        let mut i = 0;

        while i < body.len() {
            let c = body[i];
            if c == '\\' && i + 1 < body.len() {
                match body[i + 1] {
                    'r' => set.insert('\r'),
                    'n' => set.insert('\n'),
                    't' => set.insert('\t'),
                    'd' => set.ranges.push('0'..='9'),
                    's' => " \t\n\r\x0c".chars().for_each(|c| set.insert(c)),
                    'w' => {
                        set.ranges.extend(['a'..='z', 'A'..='Z', '0'..='9']);
                        set.insert('_');
                    }
                    // `\\`, `\]` and every other escaped character stand for themselves.
                    other => set.insert(other),
                }
                i += 2;
            } else if i + 2 < body.len() && body[i + 1] == '-' {
                set.ranges.push(c..=body[i + 2]);
                i += 3;
            } else {
                set.insert(c);
                i += 1;
            }
        }

        set
    }

    fn insert(&mut self, c: char) {
        self.chars.insert(c);
    }

    fn contains(&self, c: char) -> bool {
        self.chars.contains(&c) || self.ranges.iter().any(|r| r.contains(&c))
    }
}
