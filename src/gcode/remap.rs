//! Tool-index remapping over generated G-code
//!
//! The engine compacts active tools to the lowest indices regardless of what
//! the request asked for: a job meant for physical tools 2 and 3 comes back
//! selecting T0 and T1. The remap is a pure text rewrite of tool-selection
//! lines and their paired multi-tool sync lines; move geometry is untouched
//! and the engine is never re-invoked.

use crate::error::RemapError;
use crate::profile::SlotMap;
use std::collections::BTreeSet;
use tracing::info;

/// Rewrite tool selections so emitted indices match the requested slots
///
/// Standalone `T<n>` lines and `M620 S<n>`/`M621 S<n>` sync pairs are
/// rewritten through the map; unmapped indices pass through unchanged. A
/// multi-tool request that finds fewer than two distinct tool selections in
/// the stream is an error: the engine silently dropped the multi-material
/// request, and remapping the output would mislead. Identity maps leave the
/// text unchanged but still get that check; only an empty map skips the scan
/// entirely.
pub fn remap_gcode(input: &str, slot_map: &SlotMap) -> Result<String, RemapError> {
    if slot_map.is_empty() {
        return Ok(input.to_string());
    }

    let mut distinct: BTreeSet<u8> = BTreeSet::new();
    let mut output = String::with_capacity(input.len());
    let mut rewritten = 0usize;

    for line in input.split_inclusive('\n') {
        let (content, newline) = match line.strip_suffix('\n') {
            Some(rest) => (rest, "\n"),
            None => (line, ""),
        };

        if let Some(new_line) = rewrite_line(content, slot_map, &mut distinct) {
            output.push_str(&new_line);
            rewritten += 1;
        } else {
            output.push_str(content);
        }
        output.push_str(newline);
    }

    if slot_map.is_multi_tool() && distinct.len() < 2 {
        return Err(RemapError::SingleToolOutput {
            requested: slot_map.len(),
            found: distinct.len(),
        });
    }

    info!(
        rewritten,
        distinct_tools = distinct.len(),
        "remapped tool selections"
    );
    Ok(output)
}

/// Rewrite one line if it is a tool-select or sync instruction
fn rewrite_line(line: &str, slot_map: &SlotMap, distinct: &mut BTreeSet<u8>) -> Option<String> {
    let trimmed = line.trim_start();
    let indent = &line[..line.len() - trimmed.len()];

    // Standalone tool select: T<n>, optionally with a trailing comment.
    if let Some(rest) = trimmed.strip_prefix('T') {
        let digits: String = rest.chars().take_while(|c| c.is_ascii_digit()).collect();
        let tail = &rest[digits.len()..];
        let tail_ok = tail.is_empty() || tail.starts_with(' ') || tail.starts_with(';');
        if !digits.is_empty() && tail_ok {
            let tool: u8 = digits.parse().ok()?;
            distinct.insert(tool);
            let mapped = slot_map.physical(tool)?;
            if mapped == tool {
                return None;
            }
            return Some(format!("{indent}T{mapped}{tail}"));
        }
        return None;
    }

    // Multi-tool sync pair: M620 S<n>… / M621 S<n>…
    for prefix in ["M620 ", "M621 "] {
        if let Some(rest) = trimmed.strip_prefix(prefix) {
            let rest_after_s = rest.strip_prefix('S')?;
            let digits: String = rest_after_s
                .chars()
                .take_while(|c| c.is_ascii_digit())
                .collect();
            if digits.is_empty() {
                return None;
            }
            let tool: u8 = digits.parse().ok()?;
            distinct.insert(tool);
            let tail = &rest_after_s[digits.len()..];
            let mapped = slot_map.physical(tool)?;
            if mapped == tool {
                return None;
            }
            return Some(format!("{indent}{prefix}S{mapped}{tail}"));
        }
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;

    const TWO_TOOL: &str = "\
;LAYER_CHANGE
T0
M620 S0A
G1 X10 Y10 E1
M621 S0A
T1
M620 S1A
G1 X20 Y20 E1
M621 S1A
";

    #[test]
    fn rewrites_tool_selects_and_sync_pairs() {
        let map = SlotMap::from_pairs([(0, 2), (1, 3)]);
        let out = remap_gcode(TWO_TOOL, &map).unwrap();
        assert!(out.contains("\nT2\n") || out.starts_with("T2\n") || out.contains("T2\n"));
        assert!(out.contains("T3\n"));
        assert!(out.contains("M620 S2A"));
        assert!(out.contains("M621 S2A"));
        assert!(out.contains("M620 S3A"));
        assert!(!out.contains("M620 S0A"));
        // Geometry untouched.
        assert!(out.contains("G1 X10 Y10 E1"));
    }

    #[test]
    fn identity_and_empty_maps_change_nothing() {
        let identity = SlotMap::from_pairs([(0, 0), (1, 1)]);
        assert_eq!(remap_gcode(TWO_TOOL, &identity).unwrap(), TWO_TOOL);
        assert_eq!(remap_gcode(TWO_TOOL, &SlotMap::new()).unwrap(), TWO_TOOL);
    }

    #[test]
    fn unmapped_tools_pass_through() {
        let map = SlotMap::from_pairs([(0, 1), (2, 3)]);
        let out = remap_gcode(TWO_TOOL, &map).unwrap();
        assert!(out.contains("T1\n"));
        // T1 has no mapping and stays put.
        let t1_count = out.matches("T1\n").count();
        assert!(t1_count >= 2, "both the remapped T0 and the original T1: {out}");
    }

    #[test]
    fn single_tool_output_for_a_multi_tool_request_is_an_error() {
        let single = ";LAYER_CHANGE\nT0\nG1 X1 Y1 E1\n";
        let map = SlotMap::from_pairs([(0, 2), (1, 3)]);
        let err = remap_gcode(single, &map).unwrap_err();
        match err {
            RemapError::SingleToolOutput { requested, found } => {
                assert_eq!(requested, 2);
                assert_eq!(found, 1);
            }
        }
    }

    #[test]
    fn identity_two_slot_request_still_checks_for_multi_tool_output() {
        // A job explicitly requesting slots 0 and 1 needs no rewriting, but
        // single-tool output still means the engine dropped the request.
        let single = ";LAYER_CHANGE\nT0\nG1 X1 Y1 E1\n";
        let identity = SlotMap::from_pairs([(0, 0), (1, 1)]);
        let err = remap_gcode(single, &identity).unwrap_err();
        assert!(matches!(
            err,
            RemapError::SingleToolOutput {
                requested: 2,
                found: 1
            }
        ));
    }

    #[test]
    fn single_slot_request_tolerates_single_tool_output() {
        let single = "T0\nG1 X1 Y1 E1\n";
        let map = SlotMap::from_pairs([(0, 3)]);
        let out = remap_gcode(single, &map).unwrap();
        assert!(out.starts_with("T3\n"));
    }

    #[test]
    fn t_words_embedded_in_other_commands_are_untouched() {
        let text = "M104 T1 S210\nT1\nT0\n";
        let map = SlotMap::from_pairs([(0, 2), (1, 3)]);
        let out = remap_gcode(text, &map).unwrap();
        assert!(out.contains("M104 T1 S210"));
        assert!(out.contains("T3\n"));
        assert!(out.contains("T2\n"));
    }
}
