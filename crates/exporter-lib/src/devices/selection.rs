//! Device selection DSL
//!
//! `<letter>[:<range-list>]` where the letter is `f` (flex), `g` (top-level
//! indices) or `i` (sub-level indices: MIG instance, NVLink or CPU core).
//! Ranges are comma-separated `<n>` or `<start>-<end>` items, expanded into
//! explicit indices at parse time. `[-1]` means "all".

use crate::error::{ExporterError, Result};

/// Sentinel index meaning "every entity of this level".
pub const ALL: i32 = -1;

/// Parsed selection for one entity class.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceSelection {
    /// Monitor MIG instances when MIG is enabled, else top-level entities.
    pub flex: bool,
    /// Top-level indices; `[ALL]` selects everything.
    pub major: Vec<i32>,
    /// Sub-level indices; `[ALL]` selects everything.
    pub minor: Vec<i32>,
}

impl Default for DeviceSelection {
    fn default() -> Self {
        Self::flex()
    }
}

impl DeviceSelection {
    pub fn flex() -> Self {
        Self {
            flex: true,
            major: Vec::new(),
            minor: Vec::new(),
        }
    }

    /// True when `major` selects the given top-level index.
    pub fn major_selected(&self, id: u32) -> bool {
        selected(&self.major, id)
    }

    /// True when `minor` selects the given sub-level index.
    pub fn minor_selected(&self, id: u32) -> bool {
        selected(&self.minor, id)
    }

    /// Canonical DSL rendering; semantics-preserving with [`parse`].
    pub fn render(&self) -> String {
        if self.flex {
            return "f".to_string();
        }
        // A minor selection carries an implicit "all majors"; render the
        // minor side in that case.
        let (letter, list) = if !self.minor.is_empty() {
            ('i', &self.minor)
        } else {
            ('g', &self.major)
        };
        if list == &[ALL] {
            letter.to_string()
        } else {
            let items: Vec<String> = list.iter().map(|i| i.to_string()).collect();
            format!("{letter}:{}", items.join(","))
        }
    }
}

fn selected(list: &[i32], id: u32) -> bool {
    list.first() == Some(&ALL) || list.contains(&(id as i32))
}

impl std::str::FromStr for DeviceSelection {
    type Err = ExporterError;

    fn from_str(s: &str) -> Result<Self> {
        parse(s)
    }
}

/// Parse one selection DSL string.
pub fn parse(input: &str) -> Result<DeviceSelection> {
    let input = input.trim();
    let (letter, ranges) = match input.split_once(':') {
        Some((l, r)) => (l.trim(), Some(r.trim())),
        None => (input, None),
    };

    match letter {
        "f" => {
            if ranges.is_some() {
                return Err(ExporterError::Config(format!(
                    "flex selection 'f' does not accept a range list: '{input}'"
                )));
            }
            Ok(DeviceSelection::flex())
        }
        "g" => Ok(DeviceSelection {
            flex: false,
            major: parse_ranges(ranges)?,
            minor: Vec::new(),
        }),
        "i" => Ok(DeviceSelection {
            // Minor selections implicitly take every enclosing major.
            flex: false,
            major: vec![ALL],
            minor: parse_ranges(ranges)?,
        }),
        other => Err(ExporterError::Config(format!(
            "unknown device selection letter '{other}' (expected f, g or i)"
        ))),
    }
}

fn parse_ranges(ranges: Option<&str>) -> Result<Vec<i32>> {
    let Some(ranges) = ranges else {
        return Ok(vec![ALL]);
    };
    let mut out = Vec::new();
    for item in ranges.split(',') {
        let item = item.trim();
        if item.is_empty() {
            return Err(ExporterError::Config(format!(
                "empty item in range list '{ranges}'"
            )));
        }
        match item.split_once('-') {
            Some((start, end)) => {
                let start: i32 = parse_index(start)?;
                let end: i32 = parse_index(end)?;
                if start > end {
                    return Err(ExporterError::Config(format!(
                        "inverted range '{item}' in selection"
                    )));
                }
                out.extend(start..=end);
            }
            None => out.push(parse_index(item)?),
        }
    }
    Ok(out)
}

fn parse_index(s: &str) -> Result<i32> {
    s.trim()
        .parse::<i32>()
        .map_err(|_| ExporterError::Config(format!("invalid index '{s}' in device selection")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flex_rejects_ranges() {
        assert!(parse("f").unwrap().flex);
        assert!(parse("f:0").is_err());
    }

    #[test]
    fn ranges_expand_inclusively() {
        let sel = parse("g:0,2-4").unwrap();
        assert!(!sel.flex);
        assert_eq!(sel.major, vec![0, 2, 3, 4]);
        assert!(sel.minor.is_empty());
    }

    #[test]
    fn bare_letters_select_all() {
        assert_eq!(parse("g").unwrap().major, vec![ALL]);
        let minors = parse("i").unwrap();
        assert_eq!(minors.minor, vec![ALL]);
        assert_eq!(minors.major, vec![ALL]);
    }

    #[test]
    fn selection_membership() {
        let sel = parse("g:1,3").unwrap();
        assert!(sel.major_selected(1));
        assert!(!sel.major_selected(2));
        assert!(parse("g").unwrap().major_selected(7));
    }

    #[test]
    fn invalid_inputs_are_config_errors() {
        assert!(parse("x").is_err());
        assert!(parse("g:a").is_err());
        assert!(parse("g:4-2").is_err());
        assert!(parse("g:,").is_err());
    }

    #[test]
    fn render_round_trips_semantics() {
        for form in ["f", "g", "i", "g:3", "i:2", "g:1-4"] {
            let parsed = parse(form).unwrap();
            let rendered = parse(&parsed.render()).unwrap();
            assert_eq!(parsed, rendered, "round-trip failed for '{form}'");
        }
    }
}
