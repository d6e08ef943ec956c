//! Transcription result types

use serde::{Deserialize, Serialize};

/// One timed segment of a transcript
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscriptSegment {
    #[serde(default)]
    pub id: Option<i64>,
    #[serde(default)]
    pub start: Option<f64>,
    #[serde(default)]
    pub end: Option<f64>,
    #[serde(default)]
    pub text: String,
}

/// Normalised STT output
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Transcript {
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub language: Option<String>,
    #[serde(default)]
    pub segments: Vec<TranscriptSegment>,
}

impl Transcript {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ..Default::default()
        }
    }

    pub fn is_blank(&self) -> bool {
        self.text.trim().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_verbose_json() {
        let body = r#"{
            "text": " hello there",
            "language": "en",
            "duration": 1.2,
            "segments": [{"id": 0, "start": 0.0, "end": 1.2, "text": " hello there", "tokens": [1, 2]}]
        }"#;
        let t: Transcript = serde_json::from_str(body).unwrap();
        assert_eq!(t.language.as_deref(), Some("en"));
        assert_eq!(t.segments.len(), 1);
        assert_eq!(t.segments[0].end, Some(1.2));
    }

    #[test]
    fn test_parse_plain_text_payload() {
        let t: Transcript = serde_json::from_str(r#"{"text": "hi"}"#).unwrap();
        assert!(t.segments.is_empty());
        assert!(!t.is_blank());
        assert!(Transcript::new("  ").is_blank());
    }
}
