//! Conversation structurer: flat cue sequence → MeaningfulUnits.
//!
//! Structure is global (boundaries depend on the whole arc), so the episode
//! goes to the LLM in one call. The reply is validated and repaired —
//! overlapping ranges are the classic failure — and anything unusable falls
//! back to a single fragmented unit carrying a sentinel summary so
//! downstream metrics can count fallbacks.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use ai_client::{schema_of, LlmProvider, StructuredCall};
use podgraph_common::types::{Completeness, Cue, MeaningfulUnit, UnitSpec, UnitType};
use podgraph_common::unit_id;

use crate::llm::{estimate_tokens, leased_call};
use crate::rotation::CredentialRotator;
use crate::EpisodeContext;

/// Marker planted in fallback summaries; observably distinct downstream.
pub const FALLBACK_SENTINEL: &str = "[structurer-fallback]";

const SYSTEM_PROMPT: &str = "You are an expert conversation analyst specializing in podcast and \
interview structure. You identify natural conversation units where related content is discussed \
together: complete thoughts, full stories, question-and-answer exchanges. You group segments \
that belong together semantically and mark units that end mid-thought as incomplete.";

// ---------------------------------------------------------------------------
// LLM wire types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ConversationStructure {
    /// Non-overlapping index ranges covering the transcript.
    pub units: Vec<RawUnit>,
    #[serde(default)]
    pub themes: Vec<RawTheme>,
    #[serde(default)]
    pub boundaries: Vec<RawBoundary>,
    #[serde(default)]
    pub flow: Option<RawFlow>,
    #[serde(default)]
    pub insights: Option<RawInsights>,
    #[serde(default)]
    pub total_segments: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct RawUnit {
    pub start_index: i64,
    pub end_index: i64,
    /// introduction, topic_discussion, story, qa_exchange, tangent,
    /// conclusion, or other.
    pub unit_type: String,
    #[serde(default, alias = "description")]
    pub summary: String,
    #[serde(default)]
    pub themes: Vec<String>,
    /// complete, incomplete, or fragmented.
    #[serde(default)]
    pub completeness: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct RawTheme {
    pub name: String,
    /// Indices into `units`.
    #[serde(default)]
    pub related_units: Vec<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct RawBoundary {
    pub segment_index: i64,
    #[serde(default)]
    pub reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct RawFlow {
    #[serde(default)]
    pub arc: String,
    #[serde(default)]
    pub pacing: String,
    #[serde(default)]
    pub coherence: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct RawInsights {
    #[serde(default)]
    pub fragmentation: Vec<String>,
    #[serde(default)]
    pub coherence_observations: Vec<String>,
}

// ---------------------------------------------------------------------------
// Report
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StructureReport {
    pub specs: Vec<UnitSpec>,
    pub fallback_used: bool,
    /// Uncovered cue-index ranges, inclusive.
    pub gaps: Vec<(usize, usize)>,
    pub themes: Vec<String>,
}

/// Seam the orchestrator depends on; mocked in tests.
#[async_trait]
pub trait ConversationStructurer: Send + Sync {
    async fn structure(&self, cues: &[Cue], ctx: &EpisodeContext) -> StructureReport;
}

// ---------------------------------------------------------------------------
// Structurer
// ---------------------------------------------------------------------------

pub struct Structurer {
    llm: std::sync::Arc<dyn LlmProvider>,
    rotator: std::sync::Arc<CredentialRotator>,
    max_retries: u32,
}

impl Structurer {
    pub fn new(
        llm: std::sync::Arc<dyn LlmProvider>,
        rotator: std::sync::Arc<CredentialRotator>,
    ) -> Self {
        Self {
            llm,
            rotator,
            max_retries: 2,
        }
    }

    async fn call_llm(&self, user_prompt: &str) -> Option<ConversationStructure> {
        let schema = schema_of::<ConversationStructure>();
        let mut prompt = user_prompt.to_string();
        let mut attempt = 0;
        let mut repaired = false;
        loop {
            let call = StructuredCall::new(SYSTEM_PROMPT, &prompt, schema.clone())
                .temperature(0.1)
                .max_tokens(4096);
            let est = estimate_tokens(&prompt) + 1024;
            let outcome = leased_call(&self.rotator, est, |lease| async {
                let result = self
                    .llm
                    .extract_structured(&lease.api_key, &call)
                    .await
                    .and_then(|reply| {
                        let tokens = reply.total_tokens().max(est);
                        reply.parse::<ConversationStructure>().map(|v| (v, tokens))
                    });
                (lease, result)
            })
            .await;

            match outcome {
                Ok(structure) => return Some(structure),
                Err(e) if e.is_retryable() && attempt < self.max_retries => {
                    attempt += 1;
                    tokio::time::sleep(std::time::Duration::from_millis(
                        300 * 2u64.pow(attempt - 1),
                    ))
                    .await;
                }
                Err(e) if e.is_invalid_response() && !repaired => {
                    repaired = true;
                    prompt = format!(
                        "{user_prompt}\n\nReturn ONLY valid JSON matching the schema."
                    );
                }
                Err(e) => {
                    warn!(error = %e.into_pipeline_error(), "structure analysis failed");
                    return None;
                }
            }
        }
    }
}

#[async_trait]
impl ConversationStructurer for Structurer {
    async fn structure(&self, cues: &[Cue], ctx: &EpisodeContext) -> StructureReport {
        if cues.is_empty() {
            return fallback_report(cues, "empty transcript");
        }
        if cues.len() == 1 {
            return StructureReport {
                specs: vec![UnitSpec {
                    start_index: 0,
                    end_index: 0,
                    unit_type: UnitType::Other,
                    summary: "Single-segment episode".to_string(),
                    themes: Vec::new(),
                    completeness: Completeness::Complete,
                }],
                fallback_used: false,
                gaps: Vec::new(),
                themes: Vec::new(),
            };
        }

        let prompt = build_analysis_prompt(cues, ctx);
        let Some(structure) = self.call_llm(&prompt).await else {
            return fallback_report(cues, "analysis failed");
        };

        match validate_and_repair(&structure, cues.len()) {
            Some(specs) => {
                let gaps = coverage_gaps(&specs, cues.len());
                if !gaps.is_empty() {
                    warn!(?gaps, "structure leaves cues uncovered");
                }
                info!(
                    units = specs.len(),
                    segments = cues.len(),
                    "conversation structure identified"
                );
                StructureReport {
                    specs,
                    fallback_used: false,
                    gaps,
                    themes: structure.themes.iter().map(|t| t.name.clone()).collect(),
                }
            }
            None => fallback_report(cues, "invalid structure after repair"),
        }
    }
}

fn fallback_report(cues: &[Cue], why: &str) -> StructureReport {
    warn!(cues = cues.len(), why, "using deterministic fallback structure");
    StructureReport {
        specs: vec![UnitSpec {
            start_index: 0,
            end_index: cues.len().saturating_sub(1),
            unit_type: UnitType::Other,
            summary: format!("{FALLBACK_SENTINEL} single unit covering {} cues", cues.len()),
            themes: Vec::new(),
            completeness: Completeness::Fragmented,
        }],
        fallback_used: true,
        gaps: Vec::new(),
        themes: Vec::new(),
    }
}

// ---------------------------------------------------------------------------
// Prompt rendering
// ---------------------------------------------------------------------------

pub(crate) fn format_mm_ss(sec: f64) -> String {
    let total = sec.max(0.0) as u64;
    format!("{:02}:{:02}", total / 60, total % 60)
}

/// Compact transcript with per-cue markers, plus per-speaker statistics.
pub fn render_transcript(cues: &[Cue]) -> (String, Vec<SpeakerStat>) {
    let mut lines = Vec::with_capacity(cues.len());
    let mut stats: HashMap<String, SpeakerStat> = HashMap::new();

    for cue in cues {
        let speaker = cue.speaker.as_deref().unwrap_or("Unknown");
        let entry = stats
            .entry(speaker.to_string())
            .or_insert_with(|| SpeakerStat {
                speaker: speaker.to_string(),
                segments: 0,
                duration_seconds: 0.0,
            });
        entry.segments += 1;
        entry.duration_seconds += cue.duration_seconds();

        lines.push(format!(
            "[{}] [{} {}] {}",
            cue.index,
            speaker,
            format_mm_ss(cue.start_sec),
            cue.text.replace('\n', " ")
        ));
    }

    let mut stats: Vec<SpeakerStat> = stats.into_values().collect();
    stats.sort_by(|a, b| {
        b.duration_seconds
            .partial_cmp(&a.duration_seconds)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    (lines.join("\n"), stats)
}

#[derive(Debug, Clone)]
pub struct SpeakerStat {
    pub speaker: String,
    pub segments: usize,
    pub duration_seconds: f64,
}

fn build_analysis_prompt(cues: &[Cue], ctx: &EpisodeContext) -> String {
    let (transcript, stats) = render_transcript(cues);
    let speaker_summary: String = stats
        .iter()
        .map(|s| {
            format!(
                "- {}: {} segments, {:.1}s total",
                s.speaker, s.segments, s.duration_seconds
            )
        })
        .collect::<Vec<_>>()
        .join("\n");
    let total_duration = cues.last().map(|c| c.end_sec).unwrap_or(0.0);

    format!(
        "Analyze this podcast transcript to identify natural conversation structure.\n\n\
         EPISODE: {title} ({podcast})\n\n\
         TRANSCRIPT STATISTICS:\n\
         - Total segments: {count}\n\
         - Total duration: {duration:.1} seconds\n\
         - Speakers:\n{speaker_summary}\n\n\
         TRANSCRIPT (format: [segment_index] [speaker timestamp] text):\n{transcript}\n\n\
         REQUIREMENTS:\n\
         1. Identify conversation units where related content is discussed together.\n\
         2. Units must be non-overlapping index ranges that together cover all segments.\n\
         3. A unit should typically span multiple segments (average 5-10).\n\
         4. Mark units that end mid-thought as incomplete.\n\
         5. Report major themes, key boundaries, overall flow, and structural observations.\n\
         6. Set total_segments to {count}.",
        title = ctx.episode_title,
        podcast = ctx.podcast_name,
        count = cues.len(),
        duration = total_duration,
    )
}

// ---------------------------------------------------------------------------
// Validation and repair
// ---------------------------------------------------------------------------

/// Validate the LLM's ranges against the cue count and repair overlap;
/// returns None when nothing usable survives.
pub fn validate_and_repair(
    structure: &ConversationStructure,
    cue_count: usize,
) -> Option<Vec<UnitSpec>> {
    if cue_count == 0 || structure.units.is_empty() {
        return None;
    }
    let max_index = (cue_count - 1) as i64;

    let mut ranges: Vec<RawUnit> = structure
        .units
        .iter()
        .filter(|u| u.end_index >= 0 && u.start_index <= max_index)
        .cloned()
        .collect();
    for unit in &mut ranges {
        unit.start_index = unit.start_index.clamp(0, max_index);
        unit.end_index = unit.end_index.clamp(0, max_index);
    }
    ranges.retain(|u| u.start_index <= u.end_index);
    ranges.sort_by_key(|u| (u.start_index, u.end_index));

    // Touching or crossing ranges: pull the earlier unit's end back.
    for i in 0..ranges.len().saturating_sub(1) {
        let next_start = ranges[i + 1].start_index;
        if ranges[i].end_index >= next_start {
            ranges[i].end_index = next_start - 1;
        }
    }
    ranges.retain(|u| u.start_index <= u.end_index);

    if ranges.is_empty() {
        return None;
    }

    Some(
        ranges
            .into_iter()
            .map(|u| UnitSpec {
                start_index: u.start_index as usize,
                end_index: u.end_index as usize,
                unit_type: UnitType::parse_lenient(&u.unit_type),
                summary: u.summary,
                themes: u.themes,
                completeness: Completeness::parse_lenient(&u.completeness),
            })
            .collect(),
    )
}

/// Inclusive cue-index ranges not covered by any unit.
pub fn coverage_gaps(specs: &[UnitSpec], cue_count: usize) -> Vec<(usize, usize)> {
    let mut gaps = Vec::new();
    let mut next = 0usize;
    for spec in specs {
        if spec.start_index > next {
            gaps.push((next, spec.start_index - 1));
        }
        next = next.max(spec.end_index + 1);
    }
    if next < cue_count {
        gaps.push((next, cue_count - 1));
    }
    gaps
}

// ---------------------------------------------------------------------------
// Unit materialization
// ---------------------------------------------------------------------------

/// Speaker share of a cue span: primary speaker plus a percent distribution
/// rounded to one decimal, with the largest share absorbing the remainder
/// so the values sum to exactly 100.
pub fn speaker_info(cues: &[Cue]) -> (String, HashMap<String, f64>) {
    if cues.is_empty() {
        return (
            "Unknown".to_string(),
            [("Unknown".to_string(), 100.0)].into_iter().collect(),
        );
    }

    let mut durations: HashMap<String, f64> = HashMap::new();
    for cue in cues {
        let speaker = cue.speaker.clone().unwrap_or_else(|| "Unknown".to_string());
        *durations.entry(speaker).or_insert(0.0) += cue.duration_seconds();
    }
    let total: f64 = durations.values().sum();
    if total <= 0.0 {
        // Zero-length cues: fall back to equal shares by count.
        let share = (100.0 / durations.len() as f64 * 10.0).round() / 10.0;
        let mut distribution: HashMap<String, f64> =
            durations.keys().map(|s| (s.clone(), share)).collect();
        adjust_to_hundred(&mut distribution);
        let primary = distribution
            .keys()
            .min()
            .cloned()
            .unwrap_or_else(|| "Unknown".to_string());
        return (primary, distribution);
    }

    let mut distribution: HashMap<String, f64> = durations
        .iter()
        .map(|(s, d)| (s.clone(), (d / total * 1000.0).round() / 10.0))
        .collect();
    adjust_to_hundred(&mut distribution);

    let primary = durations
        .iter()
        .max_by(|a, b| a.1.partial_cmp(b.1).unwrap_or(std::cmp::Ordering::Equal))
        .map(|(s, _)| s.clone())
        .unwrap_or_else(|| "Unknown".to_string());
    (primary, distribution)
}

fn adjust_to_hundred(distribution: &mut HashMap<String, f64>) {
    let sum: f64 = distribution.values().sum();
    let remainder = 100.0 - sum;
    if remainder.abs() < f64::EPSILON {
        return;
    }
    if let Some(largest) = distribution
        .iter()
        .max_by(|a, b| a.1.partial_cmp(b.1).unwrap_or(std::cmp::Ordering::Equal))
        .map(|(s, _)| s.clone())
    {
        if let Some(v) = distribution.get_mut(&largest) {
            *v = ((*v + remainder) * 10.0).round() / 10.0;
        }
    }
}

/// Materialize MeaningfulUnits from validated specs. Unit text carries the
/// inline speaker+time markers the extractor prompt expects.
pub fn build_units(
    episode_id: &str,
    cues: &[Cue],
    report: &StructureReport,
) -> Vec<MeaningfulUnit> {
    let now = Utc::now();
    report
        .specs
        .iter()
        .filter_map(|spec| {
            let span = cues.get(spec.start_index..=spec.end_index.min(cues.len().saturating_sub(1)))?;
            if span.is_empty() {
                return None;
            }
            let start_sec = span.first().map(|c| c.start_sec).unwrap_or(0.0);
            let end_sec = span.last().map(|c| c.end_sec).unwrap_or(0.0);
            let (primary_speaker, speaker_distribution) = speaker_info(span);
            let text = span
                .iter()
                .map(|c| {
                    format!(
                        "[{} {}] {}",
                        c.speaker.as_deref().unwrap_or("Unknown"),
                        format_mm_ss(c.start_sec),
                        c.text.replace('\n', " ")
                    )
                })
                .collect::<Vec<_>>()
                .join("\n");

            Some(MeaningfulUnit {
                id: unit_id(episode_id, start_sec, end_sec),
                episode_id: episode_id.to_string(),
                start_sec,
                end_sec,
                text,
                unit_type: spec.unit_type,
                summary: spec.summary.clone(),
                themes: spec.themes.clone(),
                primary_speaker,
                speaker_distribution,
                completeness: spec.completeness,
                segment_indices: span.iter().map(|c| c.index).collect(),
                embedding: None,
                created_at: now,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cue(index: usize, start: f64, end: f64, speaker: Option<&str>) -> Cue {
        Cue {
            index,
            start_sec: start,
            end_sec: end,
            text: format!("cue {index}"),
            speaker: speaker.map(str::to_string),
        }
    }

    fn raw(start: i64, end: i64) -> RawUnit {
        RawUnit {
            start_index: start,
            end_index: end,
            unit_type: "topic_discussion".to_string(),
            summary: String::new(),
            themes: Vec::new(),
            completeness: "complete".to_string(),
        }
    }

    fn structure(units: Vec<RawUnit>) -> ConversationStructure {
        ConversationStructure {
            units,
            themes: Vec::new(),
            boundaries: Vec::new(),
            flow: None,
            insights: None,
            total_segments: 0,
        }
    }

    #[test]
    fn repairs_touching_and_crossing_overlaps() {
        // The classic: [0..48], [49..56], [56..60].
        let repaired =
            validate_and_repair(&structure(vec![raw(0, 48), raw(49, 56), raw(56, 60)]), 61)
                .unwrap();
        let ranges: Vec<(usize, usize)> = repaired
            .iter()
            .map(|u| (u.start_index, u.end_index))
            .collect();
        assert_eq!(ranges, vec![(0, 48), (49, 55), (56, 60)]);
        for pair in repaired.windows(2) {
            assert!(pair[0].end_index < pair[1].start_index);
        }
    }

    #[test]
    fn clamps_out_of_range_indices() {
        let repaired = validate_and_repair(&structure(vec![raw(-3, 5), raw(6, 99)]), 10).unwrap();
        let ranges: Vec<(usize, usize)> = repaired
            .iter()
            .map(|u| (u.start_index, u.end_index))
            .collect();
        assert_eq!(ranges, vec![(0, 5), (6, 9)]);
    }

    #[test]
    fn drops_degenerate_ranges_and_fully_out_of_range_units() {
        let repaired =
            validate_and_repair(&structure(vec![raw(5, 2), raw(20, 30), raw(0, 4)]), 10).unwrap();
        let ranges: Vec<(usize, usize)> = repaired
            .iter()
            .map(|u| (u.start_index, u.end_index))
            .collect();
        assert_eq!(ranges, vec![(0, 4)]);
    }

    #[test]
    fn empty_units_are_rejected() {
        assert!(validate_and_repair(&structure(vec![]), 10).is_none());
        assert!(validate_and_repair(&structure(vec![raw(0, 5)]), 0).is_none());
    }

    #[test]
    fn coverage_gaps_are_reported() {
        let specs = validate_and_repair(&structure(vec![raw(2, 4), raw(7, 8)]), 10).unwrap();
        assert_eq!(coverage_gaps(&specs, 10), vec![(0, 1), (5, 6), (9, 9)]);

        let full = validate_and_repair(&structure(vec![raw(0, 9)]), 10).unwrap();
        assert!(coverage_gaps(&full, 10).is_empty());
    }

    #[test]
    fn speaker_distribution_sums_to_hundred() {
        let cues = vec![
            cue(0, 0.0, 33.33, Some("A")),
            cue(1, 33.33, 66.66, Some("B")),
            cue(2, 66.66, 100.0, Some("C")),
        ];
        let (_, distribution) = speaker_info(&cues);
        let sum: f64 = distribution.values().sum();
        assert!((sum - 100.0).abs() < 0.5, "sum {sum}");
        assert_eq!(distribution.len(), 3);
    }

    #[test]
    fn primary_speaker_has_most_airtime() {
        let cues = vec![
            cue(0, 0.0, 60.0, Some("Host")),
            cue(1, 60.0, 100.0, Some("Guest")),
        ];
        let (primary, distribution) = speaker_info(&cues);
        assert_eq!(primary, "Host");
        assert_eq!(distribution["Host"], 60.0);
        assert_eq!(distribution["Guest"], 40.0);
    }

    #[test]
    fn missing_speakers_bucket_as_unknown() {
        let cues = vec![cue(0, 0.0, 50.0, None), cue(1, 50.0, 100.0, Some("Host"))];
        let (_, distribution) = speaker_info(&cues);
        assert_eq!(distribution["Unknown"], 50.0);
        assert_eq!(distribution["Host"], 50.0);
    }

    #[test]
    fn empty_cues_give_unknown_distribution() {
        let (primary, distribution) = speaker_info(&[]);
        assert_eq!(primary, "Unknown");
        assert_eq!(distribution["Unknown"], 100.0);
    }

    #[test]
    fn build_units_materializes_text_and_ids() {
        let cues = vec![
            cue(0, 0.0, 2.0, Some("Host")),
            cue(1, 2.0, 4.0, Some("Guest")),
        ];
        let report = StructureReport {
            specs: vec![UnitSpec {
                start_index: 0,
                end_index: 1,
                unit_type: UnitType::QaExchange,
                summary: "greeting".to_string(),
                themes: vec![],
                completeness: Completeness::Complete,
            }],
            fallback_used: false,
            gaps: vec![],
            themes: vec![],
        };
        let units = build_units("ep1", &cues, &report);
        assert_eq!(units.len(), 1);
        let unit = &units[0];
        assert_eq!(unit.segment_indices, vec![0, 1]);
        assert_eq!(unit.start_sec, 0.0);
        assert_eq!(unit.end_sec, 4.0);
        assert!(unit.text.contains("[Host 00:00] cue 0"));
        assert!(unit.text.contains("[Guest 00:02] cue 1"));
        assert_eq!(unit.id, unit_id("ep1", 0.0, 4.0));
    }

    #[test]
    fn fallback_report_carries_sentinel() {
        let cues = vec![cue(0, 0.0, 1.0, None), cue(1, 1.0, 2.0, None)];
        let report = fallback_report(&cues, "test");
        assert!(report.fallback_used);
        assert_eq!(report.specs.len(), 1);
        assert!(report.specs[0].summary.contains(FALLBACK_SENTINEL));
        assert_eq!(report.specs[0].completeness, Completeness::Fragmented);
        assert_eq!(report.specs[0].end_index, 1);
    }

    #[tokio::test]
    async fn single_cue_episode_becomes_one_unit_without_llm() {
        // The single-cue shortcut never reaches the provider, so a client
        // with no reachable endpoint is safe here.
        let llm = std::sync::Arc::new(ai_client::claude::Claude::new("test-model"));
        let rotator = std::sync::Arc::new(
            crate::rotation::CredentialRotator::new(
                vec!["sk-test".to_string()],
                crate::rotation::RotationConfig::default(),
                None,
            )
            .unwrap(),
        );
        let structurer = Structurer::new(llm, rotator);

        let report = structurer
            .structure(&[cue(0, 0.0, 3.0, Some("Host"))], &crate::EpisodeContext::default())
            .await;
        assert!(!report.fallback_used);
        assert_eq!(report.specs.len(), 1);
        assert_eq!(report.specs[0].start_index, 0);
        assert_eq!(report.specs[0].end_index, 0);

        let empty = structurer
            .structure(&[], &crate::EpisodeContext::default())
            .await;
        assert!(empty.fallback_used);
        assert!(empty.specs[0].summary.contains(FALLBACK_SENTINEL));
    }

    #[test]
    fn transcript_rendering_includes_markers_and_stats() {
        let cues = vec![
            cue(0, 0.0, 90.0, Some("Host")),
            cue(1, 90.0, 100.0, Some("Guest")),
        ];
        let (transcript, stats) = render_transcript(&cues);
        assert!(transcript.contains("[0] [Host 00:00] cue 0"));
        assert!(transcript.contains("[1] [Guest 01:30] cue 1"));
        assert_eq!(stats[0].speaker, "Host");
        assert!((stats[0].duration_seconds - 90.0).abs() < 1e-9);
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn repaired_units_never_overlap(
                ranges in proptest::collection::vec((0i64..100, 0i64..100), 1..12),
                cue_count in 1usize..100,
            ) {
                let units: Vec<RawUnit> = ranges
                    .into_iter()
                    .map(|(a, b)| raw(a, b))
                    .collect();
                if let Some(specs) = validate_and_repair(&structure(units), cue_count) {
                    for spec in &specs {
                        prop_assert!(spec.start_index <= spec.end_index);
                        prop_assert!(spec.end_index < cue_count);
                    }
                    for pair in specs.windows(2) {
                        prop_assert!(pair[0].end_index < pair[1].start_index);
                    }
                    prop_assert!(specs.len() <= cue_count);
                }
            }

            #[test]
            fn distribution_always_sums_to_hundred(
                speakers in proptest::collection::vec(0u8..4, 1..30),
            ) {
                let mut t = 0.0;
                let cues: Vec<Cue> = speakers
                    .iter()
                    .enumerate()
                    .map(|(i, s)| {
                        let start = t;
                        t += 1.0 + *s as f64;
                        cue(i, start, t, Some(&format!("S{s}")))
                    })
                    .collect();
                let (_, distribution) = speaker_info(&cues);
                let sum: f64 = distribution.values().sum();
                prop_assert!((sum - 100.0).abs() < 0.5, "sum {}", sum);
                for v in distribution.values() {
                    prop_assert!(*v >= 0.0);
                }
            }
        }
    }
}
