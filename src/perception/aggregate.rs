//! Perception Aggregator.
//!
//! Folds one tick's match results and text spans into an [`Observation`]
//! keyed for direct lookup. Matches and texts stay separate facets even
//! when they describe the same on-screen element.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;

use super::matcher::{sort_results, MatchResult};
use super::text::TextSpan;

/// Everything perceived in one tick. Immutable once built.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Observation {
    pub tick: u64,
    pub timestamp: Option<DateTime<Utc>>,
    matches: BTreeMap<String, Vec<MatchResult>>,
    texts: Vec<TextSpan>,
    by_region: BTreeMap<String, Vec<usize>>,
    by_text: BTreeMap<String, Vec<usize>>,
    /// Fraction of the frame that changed since the previous tick
    motion: Option<f32>,
}

/// Both facets recorded under one field name.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Facets<'a> {
    pub matches: &'a [MatchResult],
    pub texts: Vec<&'a TextSpan>,
}

/// Build the observation for one tick. Pure: the same inputs always yield
/// the same observation.
pub fn aggregate(
    matches: Vec<MatchResult>,
    mut texts: Vec<TextSpan>,
    tick: u64,
    timestamp: DateTime<Utc>,
) -> Observation {
    let mut by_template: BTreeMap<String, Vec<MatchResult>> = BTreeMap::new();
    for m in matches {
        by_template.entry(m.template_id.clone()).or_default().push(m);
    }
    for bucket in by_template.values_mut() {
        sort_results(bucket);
    }

    texts.sort_by(|a, b| {
        (a.region.as_deref(), a.bbox.y, a.bbox.x, &a.text).cmp(&(b.region.as_deref(), b.bbox.y, b.bbox.x, &b.text))
    });

    let mut by_region: BTreeMap<String, Vec<usize>> = BTreeMap::new();
    let mut by_text: BTreeMap<String, Vec<usize>> = BTreeMap::new();
    for (i, span) in texts.iter().enumerate() {
        if let Some(region) = &span.region {
            by_region.entry(region.clone()).or_default().push(i);
        }
        by_text.entry(normalize(&span.text)).or_default().push(i);
    }

    Observation {
        tick,
        timestamp: Some(timestamp),
        matches: by_template,
        texts,
        by_region,
        by_text,
        motion: None,
    }
}

/// Lowercased with runs of whitespace collapsed.
pub fn normalize(text: &str) -> String {
    text.split_whitespace()
        .map(|w| w.to_lowercase())
        .collect::<Vec<_>>()
        .join(" ")
}

impl Observation {
    pub fn with_motion(mut self, motion: Option<f32>) -> Self {
        self.motion = motion;
        self
    }

    pub fn motion(&self) -> Option<f32> {
        self.motion
    }

    /// All hits for a template, best first. Empty when absent.
    pub fn matches(&self, template_id: &str) -> &[MatchResult] {
        self.matches
            .get(template_id)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn best_match(&self, template_id: &str) -> Option<&MatchResult> {
        self.matches(template_id).first()
    }

    pub fn match_count(&self) -> usize {
        self.matches.values().map(Vec::len).sum()
    }

    pub fn texts(&self) -> &[TextSpan] {
        &self.texts
    }

    pub fn texts_in<'a>(&'a self, region: &str) -> impl Iterator<Item = &'a TextSpan> + 'a {
        self.by_region
            .get(region)
            .into_iter()
            .flatten()
            .map(move |&i| &self.texts[i])
    }

    /// Spans whose text exactly equals `text`, ignoring case and spacing.
    pub fn text_exact(&self, text: &str) -> impl Iterator<Item = &TextSpan> + '_ {
        self.by_text
            .get(&normalize(text))
            .into_iter()
            .flatten()
            .map(move |&i| &self.texts[i])
    }

    /// Spans containing `needle` (case-insensitive), optionally limited to
    /// one region. Highest confidence first.
    pub fn find_text(&self, needle: &str, region: Option<&str>) -> Vec<&TextSpan> {
        let needle = normalize(needle);
        let mut hits: Vec<&TextSpan> = match region {
            Some(r) => self.texts_in(r).collect(),
            None => self.texts.iter().collect(),
        };
        hits.retain(|span| normalize(&span.text).contains(&needle));
        hits.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));
        hits
    }

    /// Every facet recorded under `field`: template hits for a template id
    /// and text read from a region of the same name.
    pub fn facets(&self, field: &str) -> Facets<'_> {
        Facets {
            matches: self.matches(field),
            texts: self.texts_in(field).collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.matches.is_empty() && self.texts.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::perception::geometry::Rect;

    fn hit(id: &str, x: i32, confidence: f32) -> MatchResult {
        MatchResult {
            template_id: id.into(),
            bbox: Rect::new(x, 0, 10, 10),
            confidence,
            frame_timestamp: Utc::now(),
        }
    }

    fn span(text: &str, region: Option<&str>, confidence: f32) -> TextSpan {
        TextSpan {
            text: text.into(),
            bbox: Rect::new(0, 0, 30, 10),
            confidence,
            frame_timestamp: Utc::now(),
            region: region.map(String::from),
        }
    }

    #[test]
    fn test_matches_keyed_by_template() {
        let obs = aggregate(
            vec![hit("close", 5, 0.8), hit("close", 50, 0.95), hit("menu", 0, 0.9)],
            vec![],
            1,
            Utc::now(),
        );
        assert_eq!(obs.matches("close").len(), 2);
        assert_eq!(obs.best_match("close").unwrap().confidence, 0.95);
        assert!(obs.matches("absent").is_empty());
        assert_eq!(obs.match_count(), 3);
    }

    #[test]
    fn test_text_lookup_is_case_and_space_insensitive() {
        let obs = aggregate(vec![], vec![span("Press  Continue", None, 0.9)], 1, Utc::now());
        assert_eq!(obs.find_text("continue", None).len(), 1);
        assert_eq!(obs.text_exact("press continue").count(), 1);
        assert!(obs.find_text("battle", None).is_empty());
    }

    #[test]
    fn test_both_facets_retained() {
        let obs = aggregate(
            vec![hit("confirm", 0, 0.9)],
            vec![span("Confirm", Some("confirm"), 0.7)],
            3,
            Utc::now(),
        );
        let facets = obs.facets("confirm");
        assert_eq!(facets.matches.len(), 1);
        assert_eq!(facets.texts.len(), 1);
    }

    #[test]
    fn test_region_filter() {
        let obs = aggregate(
            vec![],
            vec![span("Lv. 60", Some("level"), 0.9), span("Lv. 60", Some("banner"), 0.9)],
            1,
            Utc::now(),
        );
        assert_eq!(obs.find_text("lv", Some("level")).len(), 1);
        assert_eq!(obs.texts_in("banner").count(), 1);
        assert_eq!(obs.texts_in("nowhere").count(), 0);
    }

    #[test]
    fn test_aggregate_is_deterministic() {
        let ts = Utc::now();
        let build = || {
            aggregate(
                vec![hit("a", 1, 0.9), hit("a", 2, 0.9), hit("b", 0, 0.7)],
                vec![span("x", None, 0.8), span("y", Some("r"), 0.8)],
                9,
                ts,
            )
        };
        let a = serde_json::to_string(&build()).unwrap();
        let b = serde_json::to_string(&build()).unwrap();
        assert_eq!(a, b);
    }
}
