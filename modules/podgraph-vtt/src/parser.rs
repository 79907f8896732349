use std::io::BufRead;
use std::path::Path;
use std::sync::OnceLock;

use regex::Regex;
use thiserror::Error;
use tracing::debug;

use podgraph_common::types::{Cue, EpisodeMetadata};

#[derive(Error, Debug)]
pub enum VttError {
    #[error("missing WEBVTT magic on first line")]
    MissingMagic,

    #[error("no cues produced")]
    NoCues,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// A malformed cue that was skipped or adjusted. Parsing continues past
/// warnings; only a missing magic line or an empty cue list is fatal.
#[derive(Debug, Clone, PartialEq)]
pub struct Warning {
    pub line: usize,
    pub reason: String,
}

impl std::fmt::Display for Warning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "line {}: {}", self.line, self.reason)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ParseOutcome {
    pub metadata: EpisodeMetadata,
    pub cues: Vec<Cue>,
    pub warnings: Vec<Warning>,
}

pub fn parse_file(path: &Path) -> Result<ParseOutcome, VttError> {
    let file = std::fs::File::open(path)?;
    parse_reader(std::io::BufReader::new(file))
}

pub fn parse_reader<R: BufRead>(reader: R) -> Result<ParseOutcome, VttError> {
    let mut machine = Machine::new();
    for (lineno, line) in reader.lines().enumerate() {
        machine.feed(lineno + 1, &line?);
    }
    machine.finish()
}

pub fn parse_str(input: &str) -> Result<ParseOutcome, VttError> {
    let mut machine = Machine::new();
    for (lineno, line) in input.lines().enumerate() {
        machine.feed(lineno + 1, line);
    }
    machine.finish()
}

/// Read only the leading NOTE metadata block, stopping at the first cue.
/// Cheap enough to run during routing, before the episode is parsed in full.
pub fn peek_metadata(path: &Path) -> Result<EpisodeMetadata, VttError> {
    let file = std::fs::File::open(path)?;
    let reader = std::io::BufReader::new(file);
    let mut machine = Machine::new();
    for (lineno, line) in reader.lines().enumerate() {
        let line = line?;
        if line.contains("-->") {
            break;
        }
        machine.feed(lineno + 1, &line);
        if machine.failed_magic {
            return Err(VttError::MissingMagic);
        }
    }
    if !machine.saw_magic {
        return Err(VttError::MissingMagic);
    }
    if matches!(machine.state, State::Note { leading: true }) {
        machine.apply_note_metadata();
    }
    Ok(machine.metadata)
}

// ---------------------------------------------------------------------------
// State machine
// ---------------------------------------------------------------------------

enum State {
    Header,
    Blank,
    /// Inside a NOTE block. `leading` is true only for the block that opens
    /// the file, which may carry episode metadata.
    Note { leading: bool },
    /// Inside a STYLE/REGION block, skipped wholesale.
    SkipBlock,
    /// Saw a line that may be a cue identifier; resolved on the next line.
    CueHeader,
    CueBody,
}

struct Machine {
    state: State,
    saw_magic: bool,
    saw_cue_block: bool,
    metadata: EpisodeMetadata,
    note_lines: Vec<String>,
    cues: Vec<Cue>,
    warnings: Vec<Warning>,
    current: Option<PendingCue>,
    failed_magic: bool,
}

struct PendingCue {
    start_sec: f64,
    end_sec: f64,
    lines: Vec<String>,
    header_line: usize,
}

impl Machine {
    fn new() -> Self {
        Self {
            state: State::Header,
            saw_magic: false,
            saw_cue_block: false,
            metadata: EpisodeMetadata::default(),
            note_lines: Vec::new(),
            cues: Vec::new(),
            warnings: Vec::new(),
            current: None,
            failed_magic: false,
        }
    }

    fn feed(&mut self, lineno: usize, raw: &str) {
        if self.failed_magic {
            return;
        }
        let line = raw.trim_end_matches(['\r', '\n']);

        match self.state {
            State::Header => {
                let stripped = line.trim_start_matches('\u{feff}');
                if stripped == "WEBVTT"
                    || stripped.starts_with("WEBVTT ")
                    || stripped.starts_with("WEBVTT\t")
                {
                    self.saw_magic = true;
                    self.state = State::Blank;
                } else {
                    self.failed_magic = true;
                }
            }
            State::Blank => self.feed_between_blocks(lineno, line),
            State::Note { leading } => {
                if line.trim().is_empty() {
                    if leading {
                        self.apply_note_metadata();
                    }
                    self.note_lines.clear();
                    self.state = State::Blank;
                } else if leading {
                    self.note_lines.push(line.to_string());
                }
            }
            State::SkipBlock => {
                if line.trim().is_empty() {
                    self.state = State::Blank;
                }
            }
            State::CueHeader => {
                // A candidate identifier line must be followed by a timing
                // line; anything else means the candidate was stray text.
                if let Some((start, end)) = parse_timing_line(line) {
                    self.begin_cue(lineno, start, end);
                } else if line.trim().is_empty() {
                    self.state = State::Blank;
                } else {
                    self.warnings.push(Warning {
                        line: lineno,
                        reason: format!("expected cue timing line, got '{line}'"),
                    });
                    self.state = State::Blank;
                }
            }
            State::CueBody => {
                if line.trim().is_empty() {
                    self.flush_cue();
                    self.state = State::Blank;
                } else if let Some(cue) = self.current.as_mut() {
                    cue.lines.push(line.to_string());
                }
            }
        }
    }

    fn feed_between_blocks(&mut self, lineno: usize, line: &str) {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            return;
        }
        if trimmed == "NOTE" || trimmed.starts_with("NOTE ") || trimmed.starts_with("NOTE\t") {
            let leading = !self.saw_cue_block;
            if leading {
                // Inline `NOTE key: value` form.
                let rest = trimmed.strip_prefix("NOTE").unwrap_or("").trim();
                if !rest.is_empty() {
                    self.note_lines.push(rest.to_string());
                }
            }
            self.state = State::Note { leading };
            return;
        }
        if trimmed.starts_with("STYLE") || trimmed.starts_with("REGION") {
            self.state = State::SkipBlock;
            return;
        }
        if let Some((start, end)) = parse_timing_line(line) {
            self.begin_cue(lineno, start, end);
        } else {
            // Possible cue identifier; the next line decides.
            self.state = State::CueHeader;
        }
    }

    fn begin_cue(&mut self, lineno: usize, start: f64, end: f64) {
        self.saw_cue_block = true;
        if end < start {
            self.warnings.push(Warning {
                line: lineno,
                reason: format!("cue end {end:.3} before start {start:.3}, cue dropped"),
            });
            self.current = None;
            self.state = State::CueBody;
            return;
        }
        if let Some(last) = self.cues.last() {
            if start < last.start_sec {
                self.warnings.push(Warning {
                    line: lineno,
                    reason: format!(
                        "non-monotonic cue start {start:.3} after {:.3}, cue dropped",
                        last.start_sec
                    ),
                });
                self.current = None;
                self.state = State::CueBody;
                return;
            }
        }
        self.current = Some(PendingCue {
            start_sec: start,
            end_sec: end,
            lines: Vec::new(),
            header_line: lineno,
        });
        self.state = State::CueBody;
    }

    fn flush_cue(&mut self) {
        let Some(pending) = self.current.take() else {
            return;
        };
        let body = pending.lines.join("\n");
        let (speaker, text) = extract_voice_span(&body);
        if text.trim().is_empty() {
            self.warnings.push(Warning {
                line: pending.header_line,
                reason: "cue with empty text dropped".to_string(),
            });
            return;
        }
        self.cues.push(Cue {
            index: self.cues.len(),
            start_sec: pending.start_sec,
            end_sec: pending.end_sec,
            text,
            speaker,
        });
    }

    fn apply_note_metadata(&mut self) {
        if self.note_lines.is_empty() {
            return;
        }
        let joined = self.note_lines.join("\n");
        let trimmed = joined.trim();
        if trimmed.starts_with('{') {
            if let Ok(value) = serde_json::from_str::<serde_json::Value>(trimmed) {
                let get = |k: &str| value.get(k).and_then(|v| v.as_str()).map(str::to_string);
                merge_metadata(&mut self.metadata, get("podcast_id"), get("episode"), get("youtube_url"), get("published_date"));
                return;
            }
            // Fall through to key:value parsing when the JSON is broken.
        }
        let mut podcast_id = None;
        let mut episode = None;
        let mut youtube_url = None;
        let mut published_date = None;
        for line in trimmed.lines() {
            let Some((key, value)) = line.split_once(':') else {
                continue;
            };
            let value = value.trim().to_string();
            if value.is_empty() {
                continue;
            }
            // split_once keeps everything after the first ':', so URLs
            // containing colons survive intact.
            match key.trim().to_lowercase().as_str() {
                "podcast_id" => podcast_id = Some(value),
                "episode" => episode = Some(value),
                "youtube_url" => youtube_url = Some(value),
                "published_date" => published_date = Some(value),
                _ => {}
            }
        }
        merge_metadata(&mut self.metadata, podcast_id, episode, youtube_url, published_date);
    }

    fn finish(mut self) -> Result<ParseOutcome, VttError> {
        if self.failed_magic || !self.saw_magic {
            return Err(VttError::MissingMagic);
        }
        match self.state {
            State::CueBody => self.flush_cue(),
            State::Note { leading: true } => self.apply_note_metadata(),
            _ => {}
        }
        if self.cues.is_empty() {
            return Err(VttError::NoCues);
        }
        debug!(
            cues = self.cues.len(),
            warnings = self.warnings.len(),
            "VTT parse complete"
        );
        Ok(ParseOutcome {
            metadata: self.metadata,
            cues: self.cues,
            warnings: self.warnings,
        })
    }
}

fn merge_metadata(
    meta: &mut EpisodeMetadata,
    podcast_id: Option<String>,
    episode: Option<String>,
    youtube_url: Option<String>,
    published_date: Option<String>,
) {
    if meta.podcast_id.is_none() {
        meta.podcast_id = podcast_id;
    }
    if meta.episode_title.is_none() {
        meta.episode_title = episode;
    }
    if meta.youtube_url.is_none() {
        meta.youtube_url = youtube_url;
    }
    if meta.published_date.is_none() {
        meta.published_date = published_date;
    }
}

// ---------------------------------------------------------------------------
// Timing and voice spans
// ---------------------------------------------------------------------------

/// Parse `start --> end` with optional cue settings after the end stamp.
fn parse_timing_line(line: &str) -> Option<(f64, f64)> {
    let (lhs, rhs) = line.split_once("-->")?;
    let start = parse_timestamp(lhs.trim())?;
    let end_token = rhs.trim().split_whitespace().next()?;
    let end = parse_timestamp(end_token)?;
    Some((start, end))
}

/// `MM:SS.mmm` or `HH:MM:SS.mmm`, hours unbounded.
pub fn parse_timestamp(s: &str) -> Option<f64> {
    static RE: OnceLock<Regex> = OnceLock::new();
    let re = RE.get_or_init(|| {
        Regex::new(r"^(?:(\d{1,}):)?(\d{2}):(\d{2})\.(\d{3})$").unwrap()
    });
    let caps = re.captures(s)?;
    let hours: f64 = caps
        .get(1)
        .map(|m| m.as_str().parse().unwrap_or(0.0))
        .unwrap_or(0.0);
    let minutes: f64 = caps[2].parse().ok()?;
    let seconds: f64 = caps[3].parse().ok()?;
    let millis: f64 = caps[4].parse().ok()?;
    if minutes >= 60.0 && caps.get(1).is_some() {
        return None;
    }
    if seconds >= 60.0 {
        return None;
    }
    Some(hours * 3600.0 + minutes * 60.0 + seconds + millis / 1000.0)
}

/// Extract the first `<v Name>` tag as the speaker and strip all voice
/// tags from the text.
fn extract_voice_span(body: &str) -> (Option<String>, String) {
    static TAG: OnceLock<Regex> = OnceLock::new();
    let tag = TAG.get_or_init(|| Regex::new(r"<v(?:\.[^\s>]*)?\s+([^>]+)>").unwrap());

    let speaker = tag
        .captures(body)
        .map(|caps| caps[1].trim().to_string())
        .filter(|s| !s.is_empty());

    let stripped = tag.replace_all(body, "");
    let stripped = stripped.replace("</v>", "");
    let text: Vec<&str> = stripped.lines().map(str::trim).collect();
    (speaker, text.join("\n").trim().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_missing_magic() {
        let err = parse_str("NOT A VTT FILE\n\n00:00.000 --> 00:01.000\nhi\n").unwrap_err();
        assert!(matches!(err, VttError::MissingMagic));
    }

    #[test]
    fn rejects_header_only_file() {
        let err = parse_str("WEBVTT\n\n").unwrap_err();
        assert!(matches!(err, VttError::NoCues));
    }

    #[test]
    fn parses_minimal_file() {
        let out = parse_str(
            "WEBVTT\n\n00:00:00.000 --> 00:00:02.000\nHello.\n\n00:00:02.000 --> 00:00:04.000\nGoodbye.\n",
        )
        .unwrap();
        assert_eq!(out.cues.len(), 2);
        assert_eq!(out.cues[0].index, 0);
        assert_eq!(out.cues[0].text, "Hello.");
        assert_eq!(out.cues[1].start_sec, 2.0);
        assert!(out.warnings.is_empty());
    }

    #[test]
    fn hours_are_optional() {
        let out = parse_str("WEBVTT\n\n01:30.000 --> 01:35.500\nshort form\n").unwrap();
        assert_eq!(out.cues[0].start_sec, 90.0);
        assert_eq!(out.cues[0].end_sec, 95.5);
    }

    #[test]
    fn parses_large_timestamps() {
        let out = parse_str(
            "WEBVTT\n\n01:30:00.000 --> 01:30:05.000\nafter 90 minutes\n\n02:45:30.500 --> 02:45:35.000\nlater\n",
        )
        .unwrap();
        assert_eq!(out.cues[0].start_sec, 5400.0);
        assert!((out.cues[1].start_sec - 9930.5).abs() < 0.001);
    }

    #[test]
    fn extracts_first_voice_span_and_strips_tags() {
        let out = parse_str(
            "WEBVTT\n\n00:00:00.000 --> 00:00:05.000\n<v John> Hello, I'm John.\n\n00:00:05.000 --> 00:00:10.000\n<v Sarah>Hi John.</v> <v Other>And me.\n",
        )
        .unwrap();
        assert_eq!(out.cues[0].speaker.as_deref(), Some("John"));
        assert_eq!(out.cues[0].text, "Hello, I'm John.");
        assert_eq!(out.cues[1].speaker.as_deref(), Some("Sarah"));
        assert_eq!(out.cues[1].text, "Hi John. And me.");
    }

    #[test]
    fn cue_without_voice_tag_has_no_speaker() {
        let out = parse_str("WEBVTT\n\n00:00:00.000 --> 00:00:05.000\nplain text\n").unwrap();
        assert_eq!(out.cues[0].speaker, None);
    }

    #[test]
    fn preserves_multiline_text() {
        let out = parse_str(
            "WEBVTT\n\n00:00:00.000 --> 00:00:05.000\nThis is a cue with\nmultiple lines of text\nthat should be preserved.\n",
        )
        .unwrap();
        assert_eq!(
            out.cues[0].text,
            "This is a cue with\nmultiple lines of text\nthat should be preserved."
        );
    }

    #[test]
    fn leading_note_block_key_values() {
        let out = parse_str(
            "WEBVTT\n\nNOTE\npodcast_id: my_favorite_murder\nepisode: Episode 42\nyoutube_url: https://youtu.be/abc\npublished_date: 2024-05-01\n\n00:00:00.000 --> 00:00:02.000\nhi\n",
        )
        .unwrap();
        assert_eq!(out.metadata.podcast_id.as_deref(), Some("my_favorite_murder"));
        assert_eq!(out.metadata.episode_title.as_deref(), Some("Episode 42"));
        assert_eq!(out.metadata.youtube_url.as_deref(), Some("https://youtu.be/abc"));
        assert_eq!(out.metadata.published_date.as_deref(), Some("2024-05-01"));
    }

    #[test]
    fn leading_note_block_json() {
        let out = parse_str(
            "WEBVTT\n\nNOTE\n{\"podcast_id\": \"huberman-lab\", \"episode\": \"Sleep\"}\n\n00:00:00.000 --> 00:00:02.000\nhi\n",
        )
        .unwrap();
        assert_eq!(out.metadata.podcast_id.as_deref(), Some("huberman-lab"));
        assert_eq!(out.metadata.episode_title.as_deref(), Some("Sleep"));
    }

    #[test]
    fn stray_notes_between_cues_are_ignored() {
        let out = parse_str(
            "WEBVTT\n\nNOTE\nThis is a comment that should be ignored\n\n00:00:00.000 --> 00:00:05.000\nActual content\n\nNOTE Another comment\n\n00:00:05.000 --> 00:00:10.000\nMore content\n",
        )
        .unwrap();
        assert_eq!(out.cues.len(), 2);
        for cue in &out.cues {
            assert!(!cue.text.contains("NOTE"));
            assert!(!cue.text.contains("comment"));
        }
    }

    #[test]
    fn cue_identifier_lines_are_skipped() {
        let out = parse_str(
            "WEBVTT\n\nintro-1\n00:00:00.000 --> 00:00:05.000\nwith identifier\n",
        )
        .unwrap();
        assert_eq!(out.cues.len(), 1);
        assert_eq!(out.cues[0].text, "with identifier");
    }

    #[test]
    fn malformed_cue_warns_and_continues() {
        let out = parse_str(
            "WEBVTT\n\n00:00:badtime --> 00:00:05.000\nbroken\n\n00:00:05.000 --> 00:00:10.000\ngood\n",
        )
        .unwrap();
        assert_eq!(out.cues.len(), 1);
        assert_eq!(out.cues[0].text, "good");
        assert_eq!(out.warnings.len(), 1);
    }

    #[test]
    fn non_monotonic_cue_is_dropped_with_warning() {
        let out = parse_str(
            "WEBVTT\n\n00:00:10.000 --> 00:00:12.000\nfirst\n\n00:00:05.000 --> 00:00:07.000\nout of order\n\n00:00:12.000 --> 00:00:14.000\nback on track\n",
        )
        .unwrap();
        assert_eq!(out.cues.len(), 2);
        assert!(out.warnings.iter().any(|w| w.reason.contains("non-monotonic")));
        assert!(out.cues.windows(2).all(|w| w[0].start_sec <= w[1].start_sec));
    }

    #[test]
    fn end_before_start_is_dropped_with_warning() {
        let out = parse_str(
            "WEBVTT\n\n00:00:10.000 --> 00:00:05.000\nbackwards\n\n00:00:10.000 --> 00:00:12.000\nfine\n",
        )
        .unwrap();
        assert_eq!(out.cues.len(), 1);
        assert!(out.warnings.iter().any(|w| w.reason.contains("before start")));
    }

    #[test]
    fn indices_are_monotonic_from_zero() {
        let out = parse_str(
            "WEBVTT\n\n00:00:00.000 --> 00:00:01.000\na\n\n00:00:01.000 --> 00:00:02.000\nb\n\n00:00:02.000 --> 00:00:03.000\nc\n",
        )
        .unwrap();
        let indices: Vec<usize> = out.cues.iter().map(|c| c.index).collect();
        assert_eq!(indices, vec![0, 1, 2]);
    }

    #[test]
    fn millisecond_precision_is_kept() {
        let out = parse_str(
            "WEBVTT\n\n00:00:00.999 --> 00:00:01.000\nprecise\n\n23:59:59.999 --> 24:00:00.000\nday boundary\n",
        )
        .unwrap();
        assert!((out.cues[0].start_sec - 0.999).abs() < 0.0005);
        assert!((out.cues[1].start_sec - (23.0 * 3600.0 + 59.0 * 60.0 + 59.999)).abs() < 1e-6);
    }

    #[test]
    fn peek_metadata_reads_leading_note_without_full_parse() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ep.vtt");
        std::fs::write(
            &path,
            "WEBVTT\n\nNOTE\npodcast_id: mfm\n\n00:00:00.000 --> 00:00:02.000\nhi\n",
        )
        .unwrap();
        let metadata = peek_metadata(&path).unwrap();
        assert_eq!(metadata.podcast_id.as_deref(), Some("mfm"));

        let bad = dir.path().join("bad.vtt");
        std::fs::write(&bad, "nope\n").unwrap();
        assert!(peek_metadata(&bad).is_err());
    }

    #[test]
    fn timing_line_with_cue_settings() {
        let out = parse_str(
            "WEBVTT\n\n00:00:00.000 --> 00:00:05.000 align:start position:0%\nwith settings\n",
        )
        .unwrap();
        assert_eq!(out.cues[0].end_sec, 5.0);
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;

        fn arb_vtt() -> impl Strategy<Value = String> {
            // Random cue count with jittered, possibly-overlapping stamps.
            (1usize..20, any::<u64>()).prop_map(|(n, seed)| {
                let mut out = String::from("WEBVTT\n\n");
                let mut t = (seed % 100) as f64;
                for i in 0..n {
                    let dur = 1.0 + ((seed >> (i % 32)) & 7) as f64;
                    let start = t;
                    let end = t + dur;
                    out.push_str(&format!(
                        "{} --> {}\ncue number {i}\n\n",
                        fmt(start),
                        fmt(end)
                    ));
                    // Occasionally jump backwards to exercise the warning path.
                    if i % 5 == 4 {
                        t -= 2.0;
                    } else {
                        t = end;
                    }
                }
                out
            })
        }

        fn fmt(sec: f64) -> String {
            let total_ms = (sec.max(0.0) * 1000.0).round() as u64;
            let h = total_ms / 3_600_000;
            let m = (total_ms % 3_600_000) / 60_000;
            let s = (total_ms % 60_000) / 1000;
            let ms = total_ms % 1000;
            format!("{h:02}:{m:02}:{s:02}.{ms:03}")
        }

        proptest! {
            #[test]
            fn parsed_cues_are_ordered_and_well_formed(input in arb_vtt()) {
                let out = parse_str(&input).unwrap();
                for cue in &out.cues {
                    prop_assert!(cue.end_sec >= cue.start_sec);
                }
                for pair in out.cues.windows(2) {
                    prop_assert!(pair[1].start_sec >= pair[0].start_sec);
                }
                let indices: Vec<usize> = out.cues.iter().map(|c| c.index).collect();
                prop_assert_eq!(indices, (0..out.cues.len()).collect::<Vec<_>>());
            }
        }
    }
}
