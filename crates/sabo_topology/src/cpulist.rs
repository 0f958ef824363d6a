//! Parse and emit the Linux `cpulist` format.
//!
//! Sysfs expresses processor sets as comma-separated ranges, e.g. `0-3,8,10-11`.
//! [`parse`] expands such a string into a sorted, deduplicated list of ids and
//! [`emit`] renders a list back into the canonical ranged form. Both endpoints
//! of a range are inclusive, matching the kernel's convention.

use itertools::Itertools;
use thiserror::Error;

/// A failure to interpret a cpulist string.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParseError {
    /// The list contains an empty element, e.g. `0,,2` or a trailing comma.
    #[error("empty element in cpulist {list:?}")]
    EmptyElement {
        /// The offending input string.
        list: String,
    },

    /// An element is not a valid unsigned integer.
    #[error("invalid integer {value:?} in cpulist {list:?}")]
    InvalidInteger {
        /// The element that failed to parse.
        value: String,
        /// The offending input string.
        list: String,
    },

    /// A range runs backwards, e.g. `7-3`.
    #[error("inverted range {start}-{end} in cpulist {list:?}")]
    InvertedRange {
        /// First id of the range.
        start: u32,
        /// Last id of the range.
        end: u32,
        /// The offending input string.
        list: String,
    },
}

fn parse_id(value: &str, list: &str) -> Result<u32, ParseError> {
    value.parse().map_err(|_| ParseError::InvalidInteger {
        value: value.to_string(),
        list: list.to_string(),
    })
}

/// Expands a cpulist string into a sorted, deduplicated list of ids.
///
/// An empty (or all-whitespace) input yields an empty list.
pub fn parse(list: &str) -> Result<Vec<u32>, ParseError> {
    let trimmed = list.trim();

    let mut ids = Vec::new();

    if trimmed.is_empty() {
        return Ok(ids);
    }

    for element in trimmed.split(',') {
        let element = element.trim();

        if element.is_empty() {
            return Err(ParseError::EmptyElement {
                list: list.to_string(),
            });
        }

        match element.split_once('-') {
            None => ids.push(parse_id(element, list)?),
            Some((start, end)) => {
                let start = parse_id(start, list)?;
                let end = parse_id(end, list)?;

                if start > end {
                    return Err(ParseError::InvertedRange {
                        start,
                        end,
                        list: list.to_string(),
                    });
                }

                ids.extend(start..=end);
            }
        }
    }

    ids.sort_unstable();
    ids.dedup();

    Ok(ids)
}

/// Renders a list of ids in canonical cpulist form.
///
/// Consecutive runs collapse into inclusive ranges; input order and
/// duplicates do not affect the output.
pub fn emit(ids: &[u32]) -> String {
    let mut sorted = ids.to_vec();
    sorted.sort_unstable();
    sorted.dedup();

    sorted
        .iter()
        .enumerate()
        .chunk_by(|&(index, &id)| u64::from(id).wrapping_sub(index as u64))
        .into_iter()
        .map(|(_, mut run)| {
            let (_, &first) = run.next().expect("chunk_by never yields an empty group");

            match run.last() {
                Some((_, &last)) => format!("{first}-{last}"),
                None => format!("{first}"),
            }
        })
        .join(",")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_single_ids() {
        assert_eq!(parse("0,5,3").unwrap(), vec![0, 3, 5]);
    }

    #[test]
    fn parse_ranges_and_singles() {
        assert_eq!(parse("0-3,8,10-11").unwrap(), vec![0, 1, 2, 3, 8, 10, 11]);
    }

    #[test]
    fn parse_deduplicates_overlaps() {
        assert_eq!(parse("0-4,2-6").unwrap(), vec![0, 1, 2, 3, 4, 5, 6]);
    }

    #[test]
    fn parse_empty_input_is_empty_set() {
        assert_eq!(parse("").unwrap(), Vec::<u32>::new());
        assert_eq!(parse("  \n").unwrap(), Vec::<u32>::new());
    }

    #[test]
    fn parse_rejects_empty_element() {
        assert!(matches!(
            parse("0,,2"),
            Err(ParseError::EmptyElement { .. })
        ));
        assert!(matches!(parse("0,1,"), Err(ParseError::EmptyElement { .. })));
    }

    #[test]
    fn parse_rejects_garbage() {
        assert!(matches!(
            parse("0,banana"),
            Err(ParseError::InvalidInteger { .. })
        ));
    }

    #[test]
    fn parse_rejects_inverted_range() {
        assert_eq!(
            parse("7-3"),
            Err(ParseError::InvertedRange {
                start: 7,
                end: 3,
                list: "7-3".to_string()
            })
        );
    }

    #[test]
    fn emit_collapses_runs() {
        assert_eq!(emit(&[0, 1, 2, 3, 8, 10, 11]), "0-3,8,10-11");
    }

    #[test]
    fn emit_single_id() {
        assert_eq!(emit(&[42]), "42");
    }

    #[test]
    fn emit_unsorted_input() {
        assert_eq!(emit(&[5, 1, 0, 4, 5]), "0-1,4-5");
    }

    #[test]
    fn emit_empty() {
        assert_eq!(emit(&[]), "");
    }

    #[test]
    fn round_trip() {
        let ids = parse("0-63,128-191").unwrap();
        assert_eq!(emit(&ids), "0-63,128-191");
    }
}
