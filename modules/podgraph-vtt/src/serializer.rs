use podgraph_common::types::{Cue, EpisodeMetadata};

/// Render cues (and optional episode metadata) back to WebVTT text.
/// `parse(serialize(cues))` yields an equal cue sequence.
pub fn serialize(metadata: &EpisodeMetadata, cues: &[Cue]) -> String {
    let mut out = String::from("WEBVTT\n\n");

    if !metadata.is_empty() {
        out.push_str("NOTE\n");
        if let Some(v) = &metadata.podcast_id {
            out.push_str(&format!("podcast_id: {v}\n"));
        }
        if let Some(v) = &metadata.episode_title {
            out.push_str(&format!("episode: {v}\n"));
        }
        if let Some(v) = &metadata.youtube_url {
            out.push_str(&format!("youtube_url: {v}\n"));
        }
        if let Some(v) = &metadata.published_date {
            out.push_str(&format!("published_date: {v}\n"));
        }
        out.push('\n');
    }

    for cue in cues {
        out.push_str(&format!(
            "{} --> {}\n",
            format_timestamp(cue.start_sec),
            format_timestamp(cue.end_sec)
        ));
        match &cue.speaker {
            Some(speaker) => {
                // Voice tag goes on the first line only; the parser takes
                // the first tag and strips it everywhere.
                let mut lines = cue.text.lines();
                if let Some(first) = lines.next() {
                    out.push_str(&format!("<v {speaker}>{first}\n"));
                }
                for line in lines {
                    out.push_str(line);
                    out.push('\n');
                }
            }
            None => {
                out.push_str(&cue.text);
                out.push('\n');
            }
        }
        out.push('\n');
    }

    out
}

/// Seconds to `HH:MM:SS.mmm`.
pub fn format_timestamp(sec: f64) -> String {
    let total_ms = (sec.max(0.0) * 1000.0).round() as u64;
    let hours = total_ms / 3_600_000;
    let minutes = (total_ms % 3_600_000) / 60_000;
    let seconds = (total_ms % 60_000) / 1000;
    let millis = total_ms % 1000;
    format!("{hours:02}:{minutes:02}:{seconds:02}.{millis:03}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::parse_str;

    #[test]
    fn formats_timestamps() {
        assert_eq!(format_timestamp(0.0), "00:00:00.000");
        assert_eq!(format_timestamp(90.5), "00:01:30.500");
        assert_eq!(format_timestamp(5405.0), "01:30:05.000");
        assert_eq!(format_timestamp(-1.0), "00:00:00.000");
    }

    #[test]
    fn round_trips_cues_and_metadata() {
        let input = "WEBVTT\n\nNOTE\npodcast_id: mfm\nepisode: Ep 1\n\n00:00:00.000 --> 00:00:02.000\n<v Karen>Hello there.\n\n00:00:02.000 --> 00:00:04.500\nNo speaker here,\nand a second line.\n";
        let first = parse_str(input).unwrap();
        let rendered = serialize(&first.metadata, &first.cues);
        let second = parse_str(&rendered).unwrap();
        assert_eq!(first.cues, second.cues);
        assert_eq!(first.metadata, second.metadata);
    }

    #[test]
    fn round_trips_multiline_speaker_cue() {
        let cues = vec![podgraph_common::types::Cue {
            index: 0,
            start_sec: 1.25,
            end_sec: 7.75,
            text: "line one\nline two".to_string(),
            speaker: Some("Guest".to_string()),
        }];
        let rendered = serialize(&Default::default(), &cues);
        let parsed = parse_str(&rendered).unwrap();
        assert_eq!(parsed.cues, cues);
    }
}
