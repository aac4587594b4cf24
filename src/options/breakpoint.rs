//! Breakpoint resolution for detection hits.
//!
//! A hit may carry options such as `bp0=$decoder,br=$config+0x10,count=3`.
//! Symbolic requests (`bp=$label`) are resolved against the addresses the
//! pattern engine recorded for the hit and assigned to the next free hardware
//! breakpoint register. The slot cursor lives inside a single resolution pass.

use super::token::{OptionString, OptionToken};
use std::collections::BTreeMap;
use std::fmt;
use tracing::debug;

/// Number of hardware debug registers available for breakpoints.
pub const NUMBER_OF_DEBUG_REGISTERS: usize = 4;

/// Index of a hardware breakpoint register, always below
/// [`NUMBER_OF_DEBUG_REGISTERS`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BreakpointSlot(u8);

impl BreakpointSlot {
    pub fn new(index: usize) -> Option<Self> {
        (index < NUMBER_OF_DEBUG_REGISTERS).then_some(Self(index as u8))
    }

    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for BreakpointSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Next free register for one resolution pass.
#[derive(Debug, Default, Clone, Copy)]
struct SlotCursor {
    next: usize,
}

impl SlotCursor {
    /// An explicit claim reserves the named slot and every slot below it.
    fn claim(&mut self, slot: BreakpointSlot) {
        self.next = slot.index() + 1;
    }

    fn is_exhausted(&self) -> bool {
        self.next >= NUMBER_OF_DEBUG_REGISTERS
    }

    fn take(&mut self) -> Option<BreakpointSlot> {
        let slot = BreakpointSlot::new(self.next)?;
        self.next += 1;
        Some(slot)
    }
}

/// How a token from a hit's options is treated.
#[derive(Debug, PartialEq, Eq)]
enum TokenKind<'a> {
    /// `bp2=...`, `br0=...` or `1=...`
    ExplicitSlot(BreakpointSlot),
    /// `bp=$label` or `br=$label-8`
    Symbolic { label: &'a str, suffix: &'a str },
    Plain,
}

fn classify(token: &OptionToken) -> TokenKind<'_> {
    if let Some(slot) = explicit_slot(&token.name) {
        return TokenKind::ExplicitSlot(slot);
    }

    if matches!(token.name.as_str(), "bp" | "br") && token.value.starts_with('$') {
        let (label, suffix) = split_offset(&token.value);
        return TokenKind::Symbolic {
            label: label.trim_matches('$'),
            suffix,
        };
    }

    TokenKind::Plain
}

fn explicit_slot(name: &str) -> Option<BreakpointSlot> {
    let digits = name
        .strip_prefix("bp")
        .or_else(|| name.strip_prefix("br"))
        .unwrap_or(name);

    match digits {
        "0" | "1" | "2" | "3" => digits.parse().ok().and_then(BreakpointSlot::new),
        _ => None,
    }
}

/// Split `$label+N` / `$label-N` into the label and the verbatim offset.
///
/// A minus sign takes precedence over a plus sign.
fn split_offset(value: &str) -> (&str, &str) {
    match value.find('-').or_else(|| value.find('+')) {
        Some(pos) => value.split_at(pos),
        None => (value, ""),
    }
}

/// Whether the base options already place a breakpoint at `address`.
fn has_breakpoint_at(base: &OptionString, address: u64) -> bool {
    let address = address.to_string();
    base.tokens().iter().any(|token| {
        explicit_slot(&token.name).is_some() && split_offset(&token.value).0 == address
    })
}

/// A successful breakpoint rewrite.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    /// The rewritten option string for the follow-up task.
    pub options: OptionString,
    /// Slots assigned during this pass, in assignment order.
    pub assignments: Vec<(BreakpointSlot, u64)>,
}

/// Resolve the breakpoint requests in `hit_options` against `addresses`.
///
/// Returns `None` when no symbolic request resolved to an address, in which
/// case the base options are left untouched.
pub fn resolve_breakpoints(
    base: &OptionString,
    hit_options: &str,
    addresses: &BTreeMap<String, u64>,
) -> Option<Resolution> {
    let mut cursor = SlotCursor::default();
    let mut additions: Vec<OptionToken> = Vec::new();
    let mut assignments = Vec::new();

    let keep = |token: OptionToken, additions: &mut Vec<OptionToken>| {
        // Dedup against the prior options only, not against this pass.
        if !base.contains(&token) {
            additions.push(token);
        }
    };

    for segment in hit_options.split(',') {
        let Some(token) = OptionToken::parse(segment) else {
            debug!("Skipping malformed hit option: {:?}", segment);
            continue;
        };

        match classify(&token) {
            TokenKind::ExplicitSlot(slot) => {
                cursor.claim(slot);
                keep(token, &mut additions);
            }
            _ if cursor.is_exhausted() => {
                debug!("All breakpoint registers claimed, dropping remaining options");
                break;
            }
            TokenKind::Symbolic { label, suffix } => {
                if label.is_empty() {
                    continue;
                }

                let found = addresses.iter().find(|(key, address)| {
                    key.contains(label) && !has_breakpoint_at(base, **address)
                });

                let Some((key, &address)) = found else {
                    debug!("No address recorded for breakpoint label ${}", label);
                    continue;
                };

                let Some(slot) = cursor.take() else {
                    break;
                };

                debug!("Resolved ${} via {} to {} in slot {}", label, key, address, slot);
                assignments.push((slot, address));
                keep(
                    OptionToken::new(
                        format!("{}{}", token.name, slot),
                        format!("{}{}", address, suffix),
                    ),
                    &mut additions,
                );
            }
            TokenKind::Plain => keep(token, &mut additions),
        }
    }

    if assignments.is_empty() {
        return None;
    }

    let mut options = base.clone();
    options.disable_crude_extraction();
    options.ensure("file-offsets", "1");
    options.extend(additions);
    options.ensure("auto", "1");

    Some(Resolution {
        options,
        assignments,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addresses(entries: &[(&str, u64)]) -> BTreeMap<String, u64> {
        entries
            .iter()
            .map(|(k, v)| (k.to_string(), *v))
            .collect()
    }

    #[test]
    fn test_offset_suffix_is_preserved() {
        let base = OptionString::parse("procdump=1");
        let resolution =
            resolve_breakpoints(&base, "bp=$label+10", &addresses(&[("label", 0x401000)]))
                .unwrap();

        assert_eq!(resolution.assignments.len(), 1);
        assert_eq!(resolution.options.get("bp0"), Some("4198400+10"));
        assert_eq!(
            resolution.options.to_string(),
            "procdump=0,file-offsets=1,bp0=4198400+10,auto=1"
        );
    }

    #[test]
    fn test_negative_offset() {
        let resolution = resolve_breakpoints(
            &OptionString::default(),
            "br=$decrypt-0x20",
            &addresses(&[("$decrypt", 4096)]),
        )
        .unwrap();

        assert_eq!(resolution.options.get("br0"), Some("4096-0x20"));
    }

    #[test]
    fn test_never_more_than_four_slots() {
        let table = addresses(&[("a", 1), ("b", 2), ("c", 3), ("d", 4), ("e", 5)]);
        let resolution = resolve_breakpoints(
            &OptionString::default(),
            "bp=$a,bp=$b,bp=$c,bp=$d,bp=$e",
            &table,
        )
        .unwrap();

        assert_eq!(resolution.assignments.len(), 4);
        assert!(resolution
            .assignments
            .iter()
            .all(|(slot, _)| slot.index() < NUMBER_OF_DEBUG_REGISTERS));
        assert_eq!(resolution.options.get("bp3"), Some("4"));
        assert!(!resolution.options.contains_key("bp4"));
    }

    #[test]
    fn test_explicit_slot_reserves_lower_slots() {
        let resolution = resolve_breakpoints(
            &OptionString::default(),
            "bp1=0x1000,bp=$entry",
            &addresses(&[("entry", 77)]),
        )
        .unwrap();

        assert_eq!(resolution.options.get("bp1"), Some("0x1000"));
        assert_eq!(resolution.options.get("bp2"), Some("77"));
        assert_eq!(resolution.assignments[0].0.index(), 2);
    }

    #[test]
    fn test_explicit_last_slot_drops_the_rest() {
        let result = resolve_breakpoints(
            &OptionString::default(),
            "bp3=0x10,bp=$entry,count=2",
            &addresses(&[("entry", 77)]),
        );
        assert!(result.is_none());
    }

    #[test]
    fn test_no_match_means_no_rewrite() {
        let base = OptionString::parse("procdump=1");
        assert!(resolve_breakpoints(&base, "bp=$missing,count=2", &addresses(&[("x", 1)])).is_none());
        assert!(resolve_breakpoints(&base, "garbage", &BTreeMap::new()).is_none());
    }

    #[test]
    fn test_unmatched_token_contributes_nothing() {
        let resolution = resolve_breakpoints(
            &OptionString::default(),
            "bp=$missing,bp=$found",
            &addresses(&[("found", 9)]),
        )
        .unwrap();

        assert_eq!(resolution.options.to_string(), "file-offsets=1,bp0=9,auto=1");
    }

    #[test]
    fn test_plain_tokens_dedup_against_base() {
        let base = OptionString::parse("count=2,file-offsets=0");
        let resolution = resolve_breakpoints(
            &base,
            "count=2,action0=dump,bp=$x",
            &addresses(&[("x", 5)]),
        )
        .unwrap();

        assert_eq!(
            resolution.options.to_string(),
            "count=2,file-offsets=0,action0=dump,bp0=5,auto=1"
        );
    }

    #[test]
    fn test_rerun_does_not_duplicate() {
        let table = addresses(&[("label", 0x401000)]);
        let first =
            resolve_breakpoints(&OptionString::default(), "bp=$label+10,count=1", &table).unwrap();
        let second = resolve_breakpoints(&first.options, "bp=$label+10,count=1", &table);

        // The address is already placed, so nothing new resolves.
        assert!(second.is_none());
        assert_eq!(
            first.options.to_string(),
            "file-offsets=1,bp0=4198400+10,count=1,auto=1"
        );
    }

    #[test]
    fn test_label_matches_key_substring() {
        let resolution = resolve_breakpoints(
            &OptionString::default(),
            "bp=$decoder",
            &addresses(&[("$decoder_loop", 12)]),
        )
        .unwrap();
        assert_eq!(resolution.options.get("bp0"), Some("12"));
    }

    #[test]
    fn test_numeric_slot_names() {
        assert_eq!(explicit_slot("2").map(BreakpointSlot::index), Some(2));
        assert_eq!(explicit_slot("br0").map(BreakpointSlot::index), Some(0));
        assert_eq!(explicit_slot("bp4"), None);
        assert_eq!(explicit_slot("bp"), None);
    }

    #[test]
    fn test_cursor_is_per_call() {
        let table = addresses(&[("a", 1)]);
        let first = resolve_breakpoints(&OptionString::default(), "bp=$a", &table).unwrap();
        let second = resolve_breakpoints(&OptionString::default(), "bp=$a", &table).unwrap();
        assert_eq!(first, second);
        assert_eq!(second.assignments[0].0.index(), 0);
    }
}
