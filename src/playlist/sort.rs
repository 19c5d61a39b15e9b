//! Library ordering: multi-valued sort keys and progressive ("weak") filtering.
//!
//! Every song expands into one record per combination of its sort-key tag
//! values, so a song with two artists and one album is listed twice when
//! sorting by `Artist, Album`. Records are stably sorted by a composite key
//! and then narrowed by the filter list only as far as needed to fit the
//! queue size cap.

use crate::mpd::Song;

/// `(tag, value)` pair. Serialized as a two-element JSON array.
pub type Filter = (String, String);

/// Tags whose values sort numerically (`"3/12"` sorts as 3).
const NUMERIC_TAGS: &[&str] = &["Track", "Disc"];

/// Position reported when the tracked record did not survive filtering.
pub const NOT_FOUND: i64 = -1;

/// One sort record: a song under one combination of its sort-key values.
#[derive(Debug, Clone)]
pub struct Record<'a> {
    pub song: &'a Song,
    /// Chosen value per sort key, in key order. Absent tags are `""`.
    values: Vec<&'a str>,
    key: String,
    pub target: bool,
}

impl<'a> Record<'a> {
    fn matches(&self, keys: &[String], (tag, value): &Filter) -> bool {
        match keys.iter().position(|k| k == tag) {
            Some(i) => self.values[i] == value,
            None => self
                .song
                .tag(tag)
                .is_some_and(|values| values.iter().any(|v| v == value)),
        }
    }
}

/// Result of [`sort_playlist`].
#[derive(Debug, Clone, PartialEq)]
pub struct Sorted {
    pub songs: Vec<Song>,
    /// Filters actually applied, in order.
    pub used_filters: Vec<Filter>,
    /// Index of the tracked record in `songs`, or [`NOT_FOUND`].
    pub new_pos: i64,
}

impl Sorted {
    pub fn files(&self) -> Vec<String> {
        crate::mpd::song::files(&self.songs)
    }
}

/// Expand and sort. `target` indexes the expanded record sequence in
/// library order, before sorting.
pub fn sort_records<'a>(
    library: &'a [Song],
    keys: &[String],
    target: Option<usize>,
) -> Vec<Record<'a>> {
    let mut records = Vec::with_capacity(library.len());
    for song in library {
        for values in combinations(song, keys) {
            let key = composite_key(keys, &values);
            records.push(Record {
                song,
                values,
                key,
                target: false,
            });
        }
    }
    if let Some(record) = target.and_then(|i| records.get_mut(i)) {
        record.target = true;
    }
    records.sort_by(|a, b| a.key.as_bytes().cmp(b.key.as_bytes()));
    records
}

/// Narrow `records` until at most `cap` remain. The first `must` filters
/// always apply; the rest only while the set is still over the cap.
pub fn weak_filter<'a>(
    mut records: Vec<Record<'a>>,
    keys: &[String],
    filters: &[Filter],
    must: usize,
    cap: usize,
) -> (Vec<Record<'a>>, Vec<Filter>) {
    let mut used = Vec::new();
    for (i, filter) in filters.iter().enumerate() {
        if i >= must && records.len() <= cap {
            break;
        }
        records.retain(|r| r.matches(keys, filter));
        used.push(filter.clone());
    }
    records.truncate(cap);
    (records, used)
}

pub fn sort_playlist(
    library: &[Song],
    keys: &[String],
    filters: &[Filter],
    must: usize,
    cap: usize,
    target: Option<usize>,
) -> Sorted {
    let records = sort_records(library, keys, target);
    let (records, used_filters) = weak_filter(records, keys, filters, must, cap);
    let new_pos = records
        .iter()
        .position(|r| r.target)
        .map(|i| i as i64)
        .unwrap_or(NOT_FOUND);
    Sorted {
        songs: records.into_iter().map(|r| r.song.clone()).collect(),
        used_filters,
        new_pos,
    }
}

/// Cross product of the song's values for each key.
fn combinations<'a>(song: &'a Song, keys: &[String]) -> Vec<Vec<&'a str>> {
    let mut combos: Vec<Vec<&'a str>> = vec![Vec::with_capacity(keys.len())];
    for key in keys {
        let values: Vec<&str> = match song.tag(key) {
            Some(values) if !values.is_empty() => values.iter().map(String::as_str).collect(),
            _ => vec![""],
        };
        combos = combos
            .into_iter()
            .flat_map(|prefix| {
                values.iter().map(move |v| {
                    let mut next = prefix.clone();
                    next.push(*v);
                    next
                })
            })
            .collect();
    }
    combos
}

fn composite_key(keys: &[String], values: &[&str]) -> String {
    let mut out = String::new();
    for (key, value) in keys.iter().zip(values) {
        out.push_str(&sort_value(key, value));
        // Separator below every printable byte keeps per-field ordering.
        out.push('\0');
    }
    out
}

fn sort_value(tag: &str, value: &str) -> String {
    if !NUMERIC_TAGS.contains(&tag) {
        return value.to_string();
    }
    let digits: String = value.chars().take_while(|c| c.is_ascii_digit()).collect();
    match digits.parse::<u64>() {
        Ok(n) => format!("{:010}", n),
        Err(_) => value.to_string(),
    }
}
