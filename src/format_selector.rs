use std::cmp::Ordering;

use crate::{
    error::JobError,
    media::{MediaKind, StreamVariant},
};

/// Picks exactly one variant for `kind`.
///
/// Audio requests take the highest audio bitrate among audio-only variants,
/// audio+video requests the greatest height among muxed variants. Ties keep the
/// first variant in input order. A `quality` label is honored when some
/// candidate matches it exactly, otherwise the best overall candidate is used.
pub fn select_variant<'a>(
    kind: MediaKind,
    variants: &'a [StreamVariant],
    quality: Option<&str>,
) -> Result<&'a StreamVariant, JobError> {
    let candidates: Vec<&StreamVariant> = variants
        .iter()
        .filter(|variant| matches_kind(variant, kind))
        .collect();

    if candidates.is_empty() {
        return Err(JobError::NoSuitableFormat(kind));
    }

    let requested = quality.and_then(|label| parse_quality_label(label, kind));
    let preferred: Vec<&StreamVariant> = match requested {
        Some(target) => candidates
            .iter()
            .copied()
            .filter(|variant| quality_score(variant, kind) == target as f32)
            .collect(),
        None => Vec::new(),
    };

    let pool = if preferred.is_empty() {
        &candidates
    } else {
        &preferred
    };

    best_of(pool, kind).ok_or(JobError::NoSuitableFormat(kind))
}

fn matches_kind(variant: &StreamVariant, kind: MediaKind) -> bool {
    match kind {
        MediaKind::AudioOnly => variant.has_audio && !variant.has_video,
        MediaKind::AudioVideo => variant.has_audio && variant.has_video,
    }
}

fn quality_score(variant: &StreamVariant, kind: MediaKind) -> f32 {
    match kind {
        MediaKind::AudioOnly => variant.audio_bitrate_kbps.unwrap_or_default(),
        MediaKind::AudioVideo => variant.height.unwrap_or_default() as f32,
    }
}

// `max_by` keeps the last maximum, so compare in reverse order to keep the first.
fn best_of<'a>(pool: &[&'a StreamVariant], kind: MediaKind) -> Option<&'a StreamVariant> {
    pool.iter().rev().copied().max_by(|a, b| {
        quality_score(a, kind)
            .partial_cmp(&quality_score(b, kind))
            .unwrap_or(Ordering::Equal)
    })
}

/// Reads `720p`, `1080p60` or `480` as a height, and `128k` / `160kbps` as a bitrate.
fn parse_quality_label(label: &str, kind: MediaKind) -> Option<u32> {
    let lower = label.trim().to_ascii_lowercase();
    let digits: String = lower.chars().take_while(char::is_ascii_digit).collect();
    let value = digits.parse::<u32>().ok()?;
    let suffix = &lower[digits.len()..];

    match kind {
        MediaKind::AudioVideo if suffix.is_empty() || suffix.starts_with('p') => Some(value),
        MediaKind::AudioOnly if suffix.is_empty() || suffix.starts_with('k') => Some(value),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::collections::HashMap;

    fn muxed(id: &str, height: u32) -> StreamVariant {
        StreamVariant {
            format_id: id.to_string(),
            url: format!("https://media.example/{id}"),
            http_headers: HashMap::new(),
            has_video: true,
            has_audio: true,
            height: Some(height),
            audio_bitrate_kbps: Some(128.0),
            container: "mp4".to_string(),
            content_length: None,
            quality_label: Some(format!("{height}p")),
        }
    }

    fn audio(id: &str, bitrate: f32) -> StreamVariant {
        StreamVariant {
            format_id: id.to_string(),
            url: format!("https://media.example/{id}"),
            http_headers: HashMap::new(),
            has_video: false,
            has_audio: true,
            height: None,
            audio_bitrate_kbps: Some(bitrate),
            container: "m4a".to_string(),
            content_length: None,
            quality_label: None,
        }
    }

    fn video_only(id: &str, height: u32) -> StreamVariant {
        StreamVariant {
            has_audio: false,
            audio_bitrate_kbps: None,
            ..muxed(id, height)
        }
    }

    #[test]
    fn picks_tallest_muxed_variant() {
        let variants = vec![muxed("22", 720), muxed("37", 1080)];
        let selected = select_variant(MediaKind::AudioVideo, &variants, None).unwrap();
        assert_eq!(selected.height, Some(1080));
    }

    #[test]
    fn picks_highest_bitrate_audio_variant() {
        let variants = vec![audio("139", 128.0), audio("140", 320.0)];
        let selected = select_variant(MediaKind::AudioOnly, &variants, None).unwrap();
        assert_eq!(selected.audio_bitrate_kbps, Some(320.0));
    }

    #[test]
    fn ignores_variants_with_the_wrong_capability() {
        let variants = vec![video_only("137", 2160), muxed("18", 360), audio("251", 160.0)];

        let video = select_variant(MediaKind::AudioVideo, &variants, None).unwrap();
        assert_eq!(video.format_id, "18");

        let sound = select_variant(MediaKind::AudioOnly, &variants, None).unwrap();
        assert_eq!(sound.format_id, "251");
    }

    #[test]
    fn empty_list_has_no_suitable_format() {
        let error = select_variant(MediaKind::AudioVideo, &[], None).unwrap_err();
        assert!(matches!(error, JobError::NoSuitableFormat(MediaKind::AudioVideo)));
    }

    #[test]
    fn audio_only_list_cannot_serve_video_request() {
        let variants = vec![audio("139", 48.0), audio("140", 128.0)];
        let error = select_variant(MediaKind::AudioVideo, &variants, None).unwrap_err();
        assert!(matches!(error, JobError::NoSuitableFormat(_)));
    }

    #[test]
    fn ties_keep_first_encountered_variant() {
        let variants = vec![muxed("first", 720), muxed("second", 720)];
        let selected = select_variant(MediaKind::AudioVideo, &variants, None).unwrap();
        assert_eq!(selected.format_id, "first");
    }

    #[test]
    fn honors_available_quality_label() {
        let variants = vec![muxed("18", 360), muxed("22", 720), muxed("37", 1080)];
        let selected = select_variant(MediaKind::AudioVideo, &variants, Some("720p")).unwrap();
        assert_eq!(selected.format_id, "22");
    }

    #[test]
    fn unavailable_quality_label_falls_back_to_best() {
        let variants = vec![muxed("18", 360), muxed("22", 720)];
        let selected = select_variant(MediaKind::AudioVideo, &variants, Some("1440p")).unwrap();
        assert_eq!(selected.format_id, "22");

        let selected = select_variant(MediaKind::AudioVideo, &variants, Some("best")).unwrap();
        assert_eq!(selected.format_id, "22");
    }

    #[test]
    fn audio_quality_label_matches_bitrate() {
        let variants = vec![audio("139", 48.0), audio("140", 128.0), audio("251", 160.0)];
        let selected = select_variant(MediaKind::AudioOnly, &variants, Some("128k")).unwrap();
        assert_eq!(selected.format_id, "140");
    }

    #[test]
    fn parses_quality_labels() {
        assert_eq!(parse_quality_label("720p", MediaKind::AudioVideo), Some(720));
        assert_eq!(parse_quality_label("1080p60", MediaKind::AudioVideo), Some(1080));
        assert_eq!(parse_quality_label("160kbps", MediaKind::AudioOnly), Some(160));
        assert_eq!(parse_quality_label("720p", MediaKind::AudioOnly), None);
        assert_eq!(parse_quality_label("hd", MediaKind::AudioVideo), None);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        #[test]
        fn prop_selected_height_is_maximal(heights in prop::collection::vec(144u32..4320, 1..12)) {
            let variants: Vec<StreamVariant> = heights
                .iter()
                .enumerate()
                .map(|(index, height)| muxed(&index.to_string(), *height))
                .collect();

            let selected = select_variant(MediaKind::AudioVideo, &variants, None).unwrap();
            let max = heights.iter().copied().max().unwrap();
            let first_max = heights.iter().position(|height| *height == max).unwrap();

            prop_assert_eq!(selected.height, Some(max));
            prop_assert_eq!(&selected.format_id, &first_max.to_string());
        }
    }
}
