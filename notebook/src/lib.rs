//! Notebook merge library.
//! Splits loosely structured agent notebooks into sections, reconciles a repo-local
//! notebook with the cached cross-session aggregate, and renders the result
//! deterministically so repeated merges settle on the same text.

pub mod core {
    use chrono::{DateTime, FixedOffset};
    use indexmap::IndexMap;
    use serde::{Deserialize, Serialize};

    /// First line of every rendered notebook.
    pub const NOTEBOOK_TITLE: &str = "# Notebook";
    pub const SECTION_HEADING_PREFIX: &str = "## ";
    pub const LOG_ENTRY_PREFIX: &str = "### ";
    pub const SESSION_IDS_MARKER: &str = "- session_ids";
    pub const SESSION_COUNT_MARKER: &str = "- session_count";
    pub const SESSION_IDS_LABEL: &str = "- session_ids (newest first):";

    /* --------------------------- Known sections --------------------------- */

    /// Sections every rendered notebook carries, in emission order.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub enum KnownSection {
        Purpose,
        WorkingAgreements,
        TopRules,
        UserPreferences,
        SessionIndex,
        Log,
    }

    /// How a known section combines its destination and source bodies.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum MergePolicy {
        /// Line-level union, destination lines first.
        Blocks,
        /// Append-only id list with a regenerated count.
        SessionIndex,
        /// Deduplicated, newest-first dated entries.
        Log,
    }

    impl KnownSection {
        pub const ALL: [KnownSection; 6] = [
            KnownSection::Purpose,
            KnownSection::WorkingAgreements,
            KnownSection::TopRules,
            KnownSection::UserPreferences,
            KnownSection::SessionIndex,
            KnownSection::Log,
        ];

        pub fn title(self) -> &'static str {
            match self {
                KnownSection::Purpose => "Purpose",
                KnownSection::WorkingAgreements => "Working Agreements",
                KnownSection::TopRules => "Top Rules",
                KnownSection::UserPreferences => "User Preferences",
                KnownSection::SessionIndex => "Session Index",
                KnownSection::Log => "Log",
            }
        }

        pub fn from_title(title: &str) -> Option<Self> {
            Self::ALL.into_iter().find(|section| section.title() == title)
        }

        pub fn policy(self) -> MergePolicy {
            match self {
                KnownSection::SessionIndex => MergePolicy::SessionIndex,
                KnownSection::Log => MergePolicy::Log,
                _ => MergePolicy::Blocks,
            }
        }
    }

    pub fn is_known_section(title: &str) -> bool {
        KnownSection::from_title(title).is_some()
    }

    /* ------------------------------ Documents ------------------------------ */

    /// A named block of lines delimited by a `## ` heading.
    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct Section {
        pub name: String,
        #[serde(default)]
        pub body: Vec<String>,
    }

    impl Section {
        pub fn new(name: impl Into<String>, body: Vec<String>) -> Self {
            Self {
                name: name.into(),
                body,
            }
        }
    }

    /// A notebook split into sections.
    ///
    /// Keys keep the position of their first heading; a repeated heading replaces the
    /// body accumulated so far under that name. Lines before the first heading are not
    /// part of any section and are not retained.
    #[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
    pub struct Notebook {
        #[serde(default)]
        pub sections: IndexMap<String, Vec<String>>,
    }

    impl Notebook {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn is_empty(&self) -> bool {
            self.sections.is_empty()
        }

        /// Body of `name`, or an empty slice when the section is absent.
        pub fn body(&self, name: &str) -> &[String] {
            self.sections.get(name).map(Vec::as_slice).unwrap_or(&[])
        }

        pub fn known_body(&self, section: KnownSection) -> &[String] {
            self.body(section.title())
        }

        /// Sections outside the known set, in first-seen order.
        pub fn extras(&self) -> impl Iterator<Item = (&str, &[String])> {
            self.sections
                .iter()
                .filter(|(name, _)| !is_known_section(name))
                .map(|(name, body)| (name.as_str(), body.as_slice()))
        }
    }

    /* ---------------------------- Session index ---------------------------- */

    /// Session identifiers, newest first by caller convention. Never reordered by value.
    #[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
    pub struct SessionIndex {
        #[serde(default)]
        pub ids: Vec<String>,
    }

    impl SessionIndex {
        pub fn len(&self) -> usize {
            self.ids.len()
        }

        pub fn is_empty(&self) -> bool {
            self.ids.is_empty()
        }

        pub fn contains(&self, id: &str) -> bool {
            self.ids.iter().any(|existing| existing == id)
        }

        /// Append `id` unless it is already listed. Returns whether it was added.
        pub fn push_unique(&mut self, id: &str) -> bool {
            if self.contains(id) {
                return false;
            }
            self.ids.push(id.to_string());
            true
        }
    }

    /* --------------------------------- Log --------------------------------- */

    /// Outcome of reading the timestamp token of a log entry header.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
    pub enum Stamp {
        Timestamp(DateTime<FixedOffset>),
        NoTimestamp,
    }

    impl Stamp {
        pub fn timestamp(&self) -> Option<DateTime<FixedOffset>> {
            match self {
                Stamp::Timestamp(at) => Some(*at),
                Stamp::NoTimestamp => None,
            }
        }
    }

    /// A `### ` header line plus the lines up to the next header or section end.
    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct LogEntry {
        pub stamp: Stamp,
        pub lines: Vec<String>,
    }

    impl LogEntry {
        pub fn new(stamp: Stamp, lines: Vec<String>) -> Self {
            Self { stamp, lines }
        }

        pub fn header(&self) -> Option<&str> {
            self.lines.first().map(String::as_str)
        }

        /// Lines with trailing empty lines removed.
        pub fn normalized_lines(&self) -> &[String] {
            let keep = self
                .lines
                .iter()
                .rposition(|line| !line.is_empty())
                .map_or(0, |idx| idx + 1);
            &self.lines[..keep]
        }

        pub fn normalize(&mut self) {
            let keep = self.normalized_lines().len();
            self.lines.truncate(keep);
        }

        /// Equality key used to drop repeated entries across both notebooks.
        pub fn dedup_key(&self) -> String {
            self.normalized_lines().join("\n")
        }
    }

    /* ----------------------------- Merge result ----------------------------- */

    /// Merged section bodies, ready for rendering.
    #[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
    pub struct MergedNotebook {
        #[serde(default)]
        pub known: IndexMap<KnownSection, Vec<String>>,
        #[serde(default)]
        pub extras: Vec<Section>,
    }

    impl MergedNotebook {
        pub fn body(&self, section: KnownSection) -> &[String] {
            self.known.get(&section).map(Vec::as_slice).unwrap_or(&[])
        }
    }

}

pub mod parser {
    //! Line-oriented notebook parsing.
    //!
    //! Sections and log entries are found by line prefixes. The only structured
    //! grammar is the log entry header (`### <timestamp> | summary`), parsed with `nom`.
    //! Nothing here fails: malformed input degrades to dropped lines or undated entries.

    use crate::core::*;
    use chrono::{DateTime, FixedOffset, NaiveDate, NaiveTime, Offset, TimeZone, Utc};
    use nom::{
        IResult,
        branch::alt,
        bytes::complete::{tag, take_while_m_n, take_while1},
        character::complete::{char, space1},
        combinator::{all_consuming, map, map_res, opt},
        error::VerboseError,
        sequence::{delimited, pair, preceded, tuple},
    };
    use tracing::debug;

    /* ------------------------ Public entry points ------------------------ */

    /// Parse notebook text into sections.
    pub fn parse_notebook_from_str(input: &str) -> Notebook {
        split_sections(input.lines())
    }

    /// Split lines into sections keyed by `## ` headings.
    pub fn split_sections<I, S>(lines: I) -> Notebook
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut notebook = Notebook::new();
        let mut current: Option<String> = None;
        let mut dropped = 0usize;

        for line in lines {
            let line = line.as_ref();
            if let Some(name) = section_heading(line) {
                // Repeated names keep their first position but restart the body.
                notebook.sections.insert(name.to_string(), Vec::new());
                current = Some(name.to_string());
                continue;
            }
            match &current {
                Some(name) => {
                    if let Some(body) = notebook.sections.get_mut(name) {
                        body.push(line.to_string());
                    }
                }
                None => dropped += 1,
            }
        }

        if dropped > 0 {
            debug!(dropped, "ignored lines before the first section heading");
        }
        notebook
    }

    fn section_heading(line: &str) -> Option<&str> {
        line.strip_prefix(SECTION_HEADING_PREFIX).map(str::trim)
    }

    /// Collect the ids listed under the `- session_ids` marker.
    ///
    /// The run of `- <id>` bullets ends at the first blank or non-bullet line. A
    /// `- session_count` line is skipped without ending the run; it is regenerated on
    /// output. Bullets after the run has ended are not ids and do not survive a merge.
    pub fn parse_session_index(lines: &[String]) -> SessionIndex {
        let mut index = SessionIndex::default();
        let mut in_ids = false;
        let mut run_ended = false;
        for line in lines {
            let trimmed = line.trim();
            if trimmed.starts_with(SESSION_IDS_MARKER) {
                in_ids = true;
                run_ended = false;
                continue;
            }
            if trimmed.starts_with(SESSION_COUNT_MARKER) {
                continue;
            }
            if !in_ids {
                if run_ended && trimmed.starts_with("- ") {
                    debug!(line = trimmed, "session id bullet after the id list ended; ignoring");
                }
                continue;
            }
            match trimmed.strip_prefix("- ") {
                Some(id) => index.ids.push(id.trim().to_string()),
                None => {
                    in_ids = false;
                    run_ended = true;
                }
            }
        }
        index
    }

    /// Split a `Log` section body into entries. Lines before the first `### ` are dropped.
    pub fn parse_log_entries(lines: &[String]) -> Vec<LogEntry> {
        let mut entries = Vec::new();
        let mut current: Option<LogEntry> = None;
        for line in lines {
            if line.starts_with(LOG_ENTRY_PREFIX) {
                entries.extend(current.take());
                current = Some(LogEntry::new(parse_log_stamp(line), vec![line.clone()]));
                continue;
            }
            if let Some(entry) = current.as_mut() {
                entry.lines.push(line.clone());
            }
        }
        entries.extend(current);
        entries
    }

    /// Read the timestamp from a `### <timestamp> | ...` header line.
    pub fn parse_log_stamp(header: &str) -> Stamp {
        let Ok((_, token)) = log_header_token(header) else {
            return Stamp::NoTimestamp;
        };
        match parse_timestamp(token) {
            Some(at) => Stamp::Timestamp(at),
            None => {
                debug!(token, "unparsable log timestamp; treating entry as undated");
                Stamp::NoTimestamp
            }
        }
    }

    /// Parse an ISO-8601 style token such as `2024-06-01T12:30:00Z` or
    /// `2024-06-01T12:30:00.5+02:00`. Tokens without an offset are read as UTC.
    pub fn parse_timestamp(token: &str) -> Option<DateTime<FixedOffset>> {
        all_consuming(parse_datetime)(token)
            .ok()
            .map(|(_, at)| at)
    }

    /* ----------------------------- Timestamps ----------------------------- */

    type PResult<'a, T> = IResult<&'a str, T, VerboseError<&'a str>>;

    fn is_stamp_char(c: char) -> bool {
        c.is_ascii_digit() || matches!(c, 'T' | ':' | '-' | '+' | '.' | 'Z')
    }

    fn log_header_token(i: &str) -> PResult<'_, &str> {
        delimited(
            pair(tag("###"), space1),
            take_while1(is_stamp_char),
            pair(space1, char('|')),
        )(i)
    }

    fn parse_datetime(i: &str) -> PResult<'_, DateTime<FixedOffset>> {
        map_res(
            pair(
                parse_date,
                opt(preceded(char('T'), pair(parse_time, opt(parse_offset)))),
            ),
            |(date, clock)| {
                let (time, offset) = clock.unwrap_or((NaiveTime::default(), None));
                offset
                    .unwrap_or_else(|| Utc.fix())
                    .from_local_datetime(&date.and_time(time))
                    .single()
                    .ok_or("unrepresentable local time")
            },
        )(i)
    }

    // YYYY-MM-DD | YYYYMMDD
    fn parse_date(i: &str) -> PResult<'_, NaiveDate> {
        map_res(
            alt((
                tuple((digits(4), preceded(char('-'), digits(2)), preceded(char('-'), digits(2)))),
                tuple((digits(4), digits(2), digits(2))),
            )),
            |(year, month, day)| {
                NaiveDate::from_ymd_opt(year as i32, month, day).ok_or("invalid date")
            },
        )(i)
    }

    // HH[:MM[:SS[.fraction]]] | HH[MM[SS[.fraction]]]
    fn parse_time(i: &str) -> PResult<'_, NaiveTime> {
        map_res(
            pair(
                digits(2),
                opt(alt((
                    preceded(
                        char(':'),
                        pair(digits(2), opt(preceded(char(':'), parse_seconds))),
                    ),
                    pair(digits(2), opt(parse_seconds)),
                ))),
            ),
            |(hour, rest)| {
                let (minute, (second, nano)) = match rest {
                    Some((minute, seconds)) => (minute, seconds.unwrap_or((0, 0))),
                    None => (0, (0, 0)),
                };
                NaiveTime::from_hms_nano_opt(hour, minute, second, nano).ok_or("invalid time")
            },
        )(i)
    }

    fn parse_seconds(i: &str) -> PResult<'_, (u32, u32)> {
        pair(
            digits(2),
            map(opt(preceded(char('.'), parse_fraction)), |nano| {
                nano.unwrap_or(0)
            }),
        )(i)
    }

    fn parse_fraction(i: &str) -> PResult<'_, u32> {
        map_res(
            take_while_m_n(1, 9, |c: char| c.is_ascii_digit()),
            |fraction: &str| format!("{fraction:0<9}").parse::<u32>(),
        )(i)
    }

    // Z | ±HH[[:]MM[[:]SS]]
    fn parse_offset(i: &str) -> PResult<'_, FixedOffset> {
        alt((
            map(char('Z'), |_| Utc.fix()),
            map_res(
                tuple((
                    alt((char('+'), char('-'))),
                    digits(2),
                    opt(pair(
                        preceded(opt(char(':')), digits(2)),
                        opt(preceded(opt(char(':')), digits(2))),
                    )),
                )),
                |(sign, hours, rest)| {
                    let (minutes, secs) = rest.unwrap_or((0, None));
                    let seconds = (hours * 3600 + minutes * 60 + secs.unwrap_or(0)) as i32;
                    let seconds = if sign == '-' { -seconds } else { seconds };
                    FixedOffset::east_opt(seconds).ok_or("offset out of range")
                },
            ),
        ))(i)
    }

    fn digits(count: usize) -> impl Fn(&str) -> PResult<'_, u32> {
        move |i: &str| {
            map_res(
                take_while_m_n(count, count, |c: char| c.is_ascii_digit()),
                |s: &str| s.parse::<u32>(),
            )(i)
        }
    }

}

pub mod format {
    use super::core::*;

    /// Render the merged notebook: title, the fixed sections in order, then extras.
    ///
    /// Each section body loses its trailing empty lines and is followed by exactly one
    /// blank separator, so re-merging rendered output reproduces it byte for byte.
    pub fn format_notebook(merged: &MergedNotebook) -> String {
        let mut out = String::new();
        out.push_str(NOTEBOOK_TITLE);
        out.push_str("\n\n");
        for section in KnownSection::ALL {
            push_section(&mut out, section.title(), merged.body(section));
        }
        for extra in &merged.extras {
            push_section(&mut out, &extra.name, &extra.body);
        }
        out.truncate(out.trim_end().len());
        out.push('\n');
        out
    }

    fn push_section(out: &mut String, title: &str, body: &[String]) {
        out.push_str(SECTION_HEADING_PREFIX);
        out.push_str(title);
        out.push('\n');
        let keep = body
            .iter()
            .rposition(|line| !line.is_empty())
            .map_or(0, |idx| idx + 1);
        for line in &body[..keep] {
            out.push_str(line);
            out.push('\n');
        }
        out.push('\n');
    }

    pub fn render_session_index(index: &SessionIndex) -> Vec<String> {
        let mut lines = Vec::with_capacity(index.len() + 2);
        lines.push(format!("{SESSION_COUNT_MARKER}: {}", index.len()));
        lines.push(SESSION_IDS_LABEL.to_string());
        lines.extend(index.ids.iter().map(|id| format!("  - {id}")));
        lines
    }

    /// Entries in the given order, one blank line between entries and none after the last.
    pub fn render_log(entries: &[LogEntry]) -> Vec<String> {
        let mut lines = Vec::new();
        for (idx, entry) in entries.iter().enumerate() {
            if idx > 0 {
                lines.push(String::new());
            }
            lines.extend(entry.normalized_lines().iter().cloned());
        }
        lines
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn empty_notebook_renders_every_known_heading() {
            let text = format_notebook(&MergedNotebook::default());
            assert_eq!(
                text,
                "# Notebook\n\n## Purpose\n\n## Working Agreements\n\n## Top Rules\n\n## User Preferences\n\n## Session Index\n\n## Log\n"
            );
        }

        #[test]
        fn extras_follow_log_and_output_ends_with_single_newline() {
            let mut merged = MergedNotebook::default();
            merged
                .known
                .insert(KnownSection::Log, vec!["### x | y".into()]);
            merged.extras.push(Section::new(
                "Scratch",
                vec!["note".into(), "".into(), "   ".into()],
            ));
            let text = format_notebook(&merged);
            assert!(text.ends_with("## Log\n### x | y\n\n## Scratch\nnote\n"));
        }

        #[test]
        fn whitespace_only_lines_in_extras_are_kept() {
            let mut merged = MergedNotebook::default();
            merged
                .extras
                .push(Section::new("Scratch", vec!["note".into(), "   ".into(), "".into()]));
            merged.extras.push(Section::new("Other", vec!["x".into()]));
            let text = format_notebook(&merged);
            assert!(text.ends_with("## Scratch\nnote\n   \n\n## Other\nx\n"));
        }

        #[test]
        fn session_index_render_counts_ids() {
            let index = SessionIndex {
                ids: vec!["a".into(), "b".into()],
            };
            assert_eq!(
                render_session_index(&index),
                vec![
                    "- session_count: 2",
                    "- session_ids (newest first):",
                    "  - a",
                    "  - b"
                ]
            );
        }

        #[test]
        fn log_render_separates_entries_with_one_blank() {
            let entries = vec![
                LogEntry::new(Stamp::NoTimestamp, vec!["### a | 1".into(), "".into()]),
                LogEntry::new(Stamp::NoTimestamp, vec!["### b | 2".into(), "body".into()]),
            ];
            assert_eq!(
                render_log(&entries),
                vec!["### a | 1", "", "### b | 2", "body"]
            );
            assert!(render_log(&[]).is_empty());
        }
    }
}

pub mod merge {
    //! Section merge policies and the notebook-level driver.
    //!
    //! Every function here is pure: destination is the prior aggregate, source is the
    //! newly arriving notebook. Destination content always keeps its position.

    use crate::core::*;
    use crate::format::{format_notebook, render_log, render_session_index};
    use crate::parser::{parse_log_entries, parse_notebook_from_str, parse_session_index};
    use indexmap::IndexMap;
    use std::collections::HashSet;
    use tracing::debug;

    /// Merge two notebook texts and render the result.
    pub fn merge_notebook_texts(destination: &str, source: &str) -> String {
        let destination = parse_notebook_from_str(destination);
        let source = parse_notebook_from_str(source);
        format_notebook(&merge_notebooks(&destination, &source))
    }

    pub fn merge_notebooks(destination: &Notebook, source: &Notebook) -> MergedNotebook {
        let mut known = IndexMap::new();
        for section in KnownSection::ALL {
            let dest = destination.known_body(section);
            let src = source.known_body(section);
            let body = match section.policy() {
                MergePolicy::Blocks => merge_blocks(dest, src),
                MergePolicy::SessionIndex => merge_session_sections(dest, src),
                MergePolicy::Log => merge_log_sections(dest, src),
            };
            known.insert(section, body);
        }
        MergedNotebook {
            known,
            extras: merge_extras(destination, source),
        }
    }

    /// Destination lines, then each source line not already present. Exact comparison.
    pub fn merge_blocks(destination: &[String], source: &[String]) -> Vec<String> {
        if destination.is_empty() {
            return source.to_vec();
        }
        if source.is_empty() {
            return destination.to_vec();
        }
        let mut merged = destination.to_vec();
        let mut seen: HashSet<&str> = destination.iter().map(String::as_str).collect();
        for line in source {
            if seen.insert(line.as_str()) {
                merged.push(line.clone());
            }
        }
        merged
    }

    /* ---------------------------- Session index ---------------------------- */

    /// Append-only: destination ids keep their order and form a prefix of the result.
    pub fn merge_session_index(destination: &SessionIndex, source: &SessionIndex) -> SessionIndex {
        let mut merged = destination.clone();
        for id in &source.ids {
            merged.push_unique(id);
        }
        merged
    }

    pub fn merge_session_sections(destination: &[String], source: &[String]) -> Vec<String> {
        let merged = merge_session_index(
            &parse_session_index(destination),
            &parse_session_index(source),
        );
        render_session_index(&merged)
    }

    /* --------------------------------- Log --------------------------------- */

    /// Deduplicate by normalized content (first occurrence wins, destination first),
    /// then order dated entries newest first followed by undated entries as encountered.
    pub fn merge_log_entries(destination: Vec<LogEntry>, source: Vec<LogEntry>) -> Vec<LogEntry> {
        let mut seen = HashSet::new();
        let mut dated = Vec::new();
        let mut undated = Vec::new();

        for mut entry in destination.into_iter().chain(source) {
            entry.normalize();
            if !seen.insert(entry.dedup_key()) {
                debug!(header = entry.header(), "dropping duplicate log entry");
                continue;
            }
            match entry.stamp {
                Stamp::Timestamp(at) => dated.push((at, entry)),
                Stamp::NoTimestamp => undated.push(entry),
            }
        }

        // Stable: equal instants keep concatenation order.
        dated.sort_by(|(a, _), (b, _)| b.cmp(a));
        dated
            .into_iter()
            .map(|(_, entry)| entry)
            .chain(undated)
            .collect()
    }

    pub fn merge_log_sections(destination: &[String], source: &[String]) -> Vec<String> {
        let merged = merge_log_entries(parse_log_entries(destination), parse_log_entries(source));
        render_log(&merged)
    }

    /* -------------------------------- Extras -------------------------------- */

    /// Unknown sections pass through verbatim: destination's first, then source-only names.
    pub fn merge_extras(destination: &Notebook, source: &Notebook) -> Vec<Section> {
        let mut extras: Vec<Section> = destination
            .extras()
            .map(|(name, body)| Section::new(name, body.to_vec()))
            .collect();
        for (name, body) in source.extras() {
            if destination.sections.contains_key(name) {
                continue;
            }
            extras.push(Section::new(name, body.to_vec()));
        }
        extras
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        const CANONICAL: &str = "# Notebook

## Purpose
Track the migration work.

## Working Agreements
- Run tests before pushing.

## Top Rules
- Never force push.

## User Preferences
- Prefers terse output.

## Session Index
- session_count: 2
- session_ids (newest first):
  - s-2
  - s-1

## Log
### 2024-06-01T00:00:00+00:00 | Later entry
- did later things

### 2024-01-01T00:00:00Z | Earlier entry
- did earlier things

## Scratch
loose note
";

        fn lines(items: &[&str]) -> Vec<String> {
            items.iter().map(|s| s.to_string()).collect()
        }

        fn entry(text: &str) -> Vec<String> {
            text.lines().map(str::to_string).collect()
        }

        #[test]
        fn merge_blocks_identity() {
            let x = lines(&["a", "", "b", "a"]);
            assert_eq!(merge_blocks(&[], &x), x);
            assert_eq!(merge_blocks(&x, &[]), x);
        }

        #[test]
        fn merge_blocks_appends_new_source_lines_in_order() {
            let merged = merge_blocks(&lines(&["a", "b"]), &lines(&["c", "b", "A", "c", " a"]));
            assert_eq!(merged, lines(&["a", "b", "c", "A", " a"]));
        }

        #[test]
        fn session_index_is_append_only() {
            let dest = SessionIndex {
                ids: lines(&["a", "b"]),
            };
            let src = SessionIndex {
                ids: lines(&["b", "c"]),
            };
            let merged = merge_session_index(&dest, &src);
            assert_eq!(merged.ids, lines(&["a", "b", "c"]));
            assert_eq!(merged.len(), 3);
        }

        #[test]
        fn session_sections_regenerate_count() {
            let dest = lines(&["- session_count: 7", "- session_ids (newest first):", "  - a", "  - b"]);
            let src = lines(&["- session_ids:", "  - b", "  - c"]);
            let merged = merge_session_sections(&dest, &src);
            assert_eq!(merged[0], "- session_count: 3");
            assert_eq!(&merged[2..], &lines(&["  - a", "  - b", "  - c"])[..]);
        }

        #[test]
        fn identical_log_entries_keep_one_destination_copy() {
            let dest = entry("### 2024-01-01T00:00:00Z | Entry\nbody");
            let src = entry("### 2024-01-01T00:00:00Z | Entry\nbody\n\n\n");
            let merged = merge_log_sections(&dest, &src);
            assert_eq!(merged, dest);
        }

        #[test]
        fn log_orders_newest_first_then_undated() {
            let dest = entry(
                "### someday | undated first\nnote\n\n### 2024-01-01T00:00:00Z | January",
            );
            let src = entry("### 2024-06-01T00:00:00+00:00 | June\n### later | undated second");
            let merged = merge_log_sections(&dest, &src);
            let headers: Vec<&str> = merged
                .iter()
                .filter(|line| line.starts_with("### "))
                .map(String::as_str)
                .collect();
            assert_eq!(
                headers,
                vec![
                    "### 2024-06-01T00:00:00+00:00 | June",
                    "### 2024-01-01T00:00:00Z | January",
                    "### someday | undated first",
                    "### later | undated second",
                ]
            );

            // Contribution side does not matter.
            let swapped = merge_log_sections(&src, &dest);
            let first = swapped.first().map(String::as_str);
            assert_eq!(first, Some("### 2024-06-01T00:00:00+00:00 | June"));
        }

        #[test]
        fn basic_format_timestamps_sort_with_extended_ones() {
            let dest = entry("### 2024-01-01T00:00:00Z | old");
            let src = entry("### 20250101T1030Z | morning\n### 2025-01-01T00:00:00+00:00:00 | midnight");
            let merged = merge_log_sections(&dest, &src);
            assert_eq!(
                merged,
                lines(&[
                    "### 20250101T1030Z | morning",
                    "",
                    "### 2025-01-01T00:00:00+00:00:00 | midnight",
                    "",
                    "### 2024-01-01T00:00:00Z | old",
                ])
            );
        }

        #[test]
        fn equal_timestamps_keep_concatenation_order() {
            let dest = entry("### 2024-01-01T00:00:00Z | from destination");
            let src = entry("### 2024-01-01T01:00:00+01:00 | from source");
            let merged = merge_log_sections(&dest, &src);
            assert_eq!(
                merged,
                lines(&[
                    "### 2024-01-01T00:00:00Z | from destination",
                    "",
                    "### 2024-01-01T01:00:00+01:00 | from source",
                ])
            );
        }

        #[test]
        fn source_extras_follow_destination_extras() {
            let dest = parse_notebook_from_str("## Notes\ndest notes\n## Purpose\nwhy\n");
            let src = parse_notebook_from_str("## Scratch\nscratch\n## Notes\nsrc notes\n");
            let extras = merge_extras(&dest, &src);
            assert_eq!(
                extras,
                vec![
                    Section::new("Notes", lines(&["dest notes"])),
                    Section::new("Scratch", lines(&["scratch"])),
                ]
            );
        }

        #[test]
        fn source_only_extra_lands_after_log() {
            let dest = "## Purpose\nwhy\n## Log\n### 2024-01-01 | x\n";
            let src = "## Scratch\nscratch body\n";
            let text = merge_notebook_texts(dest, src);
            assert!(text.ends_with("## Log\n### 2024-01-01 | x\n\n## Scratch\nscratch body\n"));
        }

        #[test]
        fn canonical_notebook_round_trips() {
            assert_eq!(merge_notebook_texts(CANONICAL, ""), CANONICAL);
        }

        #[test]
        fn merging_with_itself_is_idempotent() {
            let once = merge_notebook_texts(CANONICAL, CANONICAL);
            assert_eq!(once, CANONICAL);

            let rendered = merge_notebook_texts("## Purpose\nwhy\n\n## Log\n### x | y\n", "");
            assert_eq!(merge_notebook_texts(&rendered, &rendered), rendered);
        }

        #[test]
        fn re_merging_rendered_output_is_stable() {
            let first = merge_notebook_texts(
                "## Top Rules\n- one\n",
                "## Top Rules\n- two\n\n## Session Index\n- session_ids:\n  - s1\n",
            );
            let second = merge_notebook_texts(&first, "");
            assert_eq!(first, second);
            let reparsed = parse_notebook_from_str(&second);
            assert_eq!(
                reparsed.known_body(KnownSection::TopRules),
                &lines(&["- one", "- two", ""])[..]
            );
        }

        #[test]
        fn merged_known_sections_come_out_in_fixed_order() {
            let dest = parse_notebook_from_str("## Log\n## Scratch\n## Purpose\nwhy\n");
            let merged = merge_notebooks(&dest, &Notebook::new());
            let order: Vec<KnownSection> = merged.known.keys().copied().collect();
            assert_eq!(order, KnownSection::ALL.to_vec());
            let text = format_notebook(&merged);
            let purpose = text.find("## Purpose").expect("purpose heading");
            let log = text.find("## Log").expect("log heading");
            let scratch = text.find("## Scratch").expect("scratch heading");
            assert!(purpose < log && log < scratch);
        }
    }
}

pub mod project {
    //! Project identity and notebook locations.
    //!
    //! The library never reads the environment: the cache home arrives as an explicit
    //! path, resolved by the caller.

    use anyhow::{Context, Result};
    use serde::Serialize;
    use std::{
        fs, io,
        path::{Path, PathBuf},
        process::Command,
    };
    use tracing::{debug, warn};

    pub const NOTEBOOK_FILE: &str = "notebook.md";
    pub const REPO_NOTEBOOK_DIR: &str = ".agents";
    pub const CACHE_NOTEBOOK_DIR: &str = "agents";

    #[derive(Debug, Clone, PartialEq, Eq, Serialize)]
    pub struct ProjectPaths {
        pub repo_root: PathBuf,
        pub repo_name: String,
        /// Repo-local notebook consumed by a migration.
        pub source: PathBuf,
        /// Cached aggregate notebook.
        pub destination: PathBuf,
    }

    impl ProjectPaths {
        pub fn resolve(repo_root: &Path, cache_home: &Path) -> Self {
            let repo_name = resolve_repo_name(repo_root);
            Self::with_name(repo_root, &repo_name, cache_home)
        }

        pub fn with_name(repo_root: &Path, repo_name: &str, cache_home: &Path) -> Self {
            Self {
                repo_root: repo_root.to_path_buf(),
                repo_name: repo_name.to_string(),
                source: repo_root.join(REPO_NOTEBOOK_DIR).join(NOTEBOOK_FILE),
                destination: cache_home
                    .join(CACHE_NOTEBOOK_DIR)
                    .join(repo_name)
                    .join(NOTEBOOK_FILE),
            }
        }
    }

    /// Top level of the git checkout containing `start`, or `start` itself.
    pub fn resolve_repo_root(start: &Path) -> PathBuf {
        match git(start, &["rev-parse", "--show-toplevel"]) {
            Some(top) => PathBuf::from(top),
            None => start.to_path_buf(),
        }
    }

    /// Name of the `origin` remote's repository, falling back to the directory name.
    pub fn resolve_repo_name(repo_root: &Path) -> String {
        git(repo_root, &["remote", "get-url", "origin"])
            .as_deref()
            .and_then(repo_name_from_remote)
            .unwrap_or_else(|| {
                repo_root
                    .file_name()
                    .map(|name| name.to_string_lossy().into_owned())
                    .unwrap_or_default()
            })
    }

    /// `https://host/org/repo.git` and `git@host:repo.git` both yield `repo`.
    pub fn repo_name_from_remote(remote: &str) -> Option<String> {
        let trimmed = remote.trim().trim_end_matches('/');
        let base = trimmed.rsplit(|c: char| c == '/' || c == ':').next()?;
        let name = base.strip_suffix(".git").unwrap_or(base);
        (!name.is_empty()).then(|| name.to_string())
    }

    pub fn default_cache_home() -> Option<PathBuf> {
        dirs::home_dir().map(|home| home.join(".cache"))
    }

    /// Read a notebook, returning `None` when the file does not exist.
    pub fn read_notebook(path: &Path) -> Result<Option<String>> {
        match fs::read_to_string(path) {
            Ok(text) => Ok(Some(text)),
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "notebook not found");
                Ok(None)
            }
            Err(err) => Err(err).with_context(|| format!("reading {:?}", path)),
        }
    }

    fn git(dir: &Path, args: &[&str]) -> Option<String> {
        match Command::new("git").args(args).current_dir(dir).output() {
            Ok(output) if output.status.success() => {
                let text = String::from_utf8_lossy(&output.stdout).trim().to_string();
                (!text.is_empty()).then_some(text)
            }
            Ok(output) => {
                debug!(?args, status = %output.status, "git exited unsuccessfully");
                None
            }
            Err(err) => {
                warn!(%err, "could not run git; falling back to directory names");
                None
            }
        }
    }

}

pub mod commit {
    //! All-or-nothing publication of a merged notebook.

    use std::{
        fs, io,
        io::Write,
        path::{Path, PathBuf},
    };
    use tempfile::Builder;
    use tracing::info;

    #[derive(Debug, thiserror::Error)]
    pub enum CommitError {
        #[error("creating directory {path:?}")]
        CreateDir { path: PathBuf, source: io::Error },
        #[error("writing temporary notebook in {dir:?}")]
        WriteTemp { dir: PathBuf, source: io::Error },
        #[error("replacing {path:?}")]
        Persist { path: PathBuf, source: io::Error },
        #[error("verifying {path:?}")]
        Verify { path: PathBuf, source: io::Error },
        #[error("{0:?} is empty after publishing")]
        EmptyDestination(PathBuf),
        #[error("removing consumed notebook {path:?}")]
        RemoveSource { path: PathBuf, source: io::Error },
    }

    /// Write `merged` to a temp file beside `destination`, rename it into place, verify
    /// the result, and only then delete `consumed_source`.
    ///
    /// Any failure before the delete leaves `consumed_source` in place so the merge can
    /// be retried; the temp file is removed when dropped.
    pub fn commit(
        merged: &str,
        destination: &Path,
        consumed_source: Option<&Path>,
    ) -> Result<(), CommitError> {
        let dir = match destination.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        fs::create_dir_all(dir).map_err(|source| CommitError::CreateDir {
            path: dir.to_path_buf(),
            source,
        })?;

        let write_err = |source: io::Error| CommitError::WriteTemp {
            dir: dir.to_path_buf(),
            source,
        };
        let mut tmp = Builder::new()
            .prefix(".notebook.")
            .suffix(".md.tmp")
            .tempfile_in(dir)
            .map_err(write_err)?;
        tmp.write_all(merged.as_bytes()).map_err(write_err)?;
        tmp.as_file().sync_all().map_err(write_err)?;

        tmp.persist(destination)
            .map_err(|err| CommitError::Persist {
                path: destination.to_path_buf(),
                source: err.error,
            })?;

        let written = fs::metadata(destination).map_err(|source| CommitError::Verify {
            path: destination.to_path_buf(),
            source,
        })?;
        if written.len() == 0 {
            return Err(CommitError::EmptyDestination(destination.to_path_buf()));
        }
        info!(destination = %destination.display(), bytes = written.len(), "published notebook");

        if let Some(source_path) = consumed_source {
            fs::remove_file(source_path).map_err(|source| CommitError::RemoveSource {
                path: source_path.to_path_buf(),
                source,
            })?;
            info!(source = %source_path.display(), "removed consumed notebook");
        }
        Ok(())
    }

}

pub use commit::{CommitError, commit};
pub use format::format_notebook;
pub use merge::{merge_notebook_texts, merge_notebooks};
pub use parser::parse_notebook_from_str;
pub use project::{ProjectPaths, read_notebook};
