//! Conversion between XPath-like strings and gNMI `Path` messages.

use std::collections::HashMap;

use crate::proto::{Path, PathElem};

/// Parse an XPath-like path into a gNMI `Path`.
///
/// e.g. `/interface[name=ethernet-1/1]/statistics`. Slashes inside key
/// brackets belong to the key value.
pub fn parse_path(path_str: &str) -> Path {
    let elem = split_segments(path_str)
        .into_iter()
        .filter(|s| !s.is_empty())
        .map(|segment| {
            let (name, key) = parse_path_segment(segment);
            PathElem { name, key }
        })
        .collect();

    Path {
        elem,
        ..Default::default()
    }
}

/// Parse one segment, e.g. `entry[sequence-id=*]` or `a[x=1][y=2]`.
pub fn parse_path_segment(segment: &str) -> (String, HashMap<String, String>) {
    let Some(bracket_pos) = segment.find('[') else {
        return (segment.to_string(), HashMap::new());
    };

    let name = segment[..bracket_pos].to_string();
    let mut keys = HashMap::new();

    for part in segment[bracket_pos..].split('[').filter(|p| !p.is_empty()) {
        let part = part.strip_suffix(']').unwrap_or(part);
        for key_val in part.split(',') {
            if let Some((k, v)) = key_val.split_once('=') {
                keys.insert(k.trim().to_string(), v.trim().to_string());
            }
        }
    }

    (name, keys)
}

fn split_segments(path_str: &str) -> Vec<&str> {
    let mut segments = Vec::new();
    let mut depth = 0usize;
    let mut start = 0;

    for (i, c) in path_str.char_indices() {
        match c {
            '[' => depth += 1,
            ']' => depth = depth.saturating_sub(1),
            '/' if depth == 0 => {
                segments.push(&path_str[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    segments.push(&path_str[start..]);
    segments
}

/// Render only element names with a leading slash, e.g. `/interface/statistics`.
pub fn path_to_xpath(elems: &[PathElem]) -> String {
    let mut out = String::new();
    for elem in elems {
        out.push('/');
        out.push_str(&elem.name);
    }
    out
}
