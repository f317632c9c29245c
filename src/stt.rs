//! Speech-to-text collaborator.
//!
//! The live pipeline only depends on the [`SpeechToText`] trait; the shipped
//! implementation posts each chunk to Deepgram's pre-recorded endpoint and
//! retries transient failures with a short backoff.

use std::time::Instant;

use serde_json::Value;
use tracing::{debug, warn};

use crate::error::SttError;

/// One transcription result tied back to the chunk that produced it.
#[derive(Debug, Clone, PartialEq)]
pub struct TranscriptSegment {
    pub text: String,
    /// Interim segments may be superseded by later ones for the same
    /// utterance; only final segments are eligible to trigger commands.
    pub is_final: bool,
    pub chunk_index: u64,
    /// Provider processing time.
    pub duration_ms: f64,
    pub confidence: f32,
}

impl TranscriptSegment {
    /// True when the segment carries no meaningful text.
    pub fn is_empty(&self) -> bool {
        self.text.trim().trim_matches('.').trim().is_empty()
    }
}

/// Chunks below this are silence or noise, not worth a provider round trip.
pub const MIN_AUDIO_SIZE_BYTES: usize = 1000;
/// Provider upload limit.
pub const MAX_AUDIO_SIZE_BYTES: usize = 25 * 1024 * 1024;

/// Audio formats accepted from clients.
const SUPPORTED_CONTENT_TYPES: [&str; 6] = [
    "audio/webm",
    "audio/ogg",
    "audio/wav",
    "audio/x-wav",
    "audio/mpeg",
    "audio/pcm",
];

/// Validate a chunk before spending a provider call on it.
pub fn validate_audio(audio: &[u8], content_type: &str) -> Result<(), SttError> {
    if audio.len() < MIN_AUDIO_SIZE_BYTES {
        return Err(SttError::ChunkTooSmall {
            size: audio.len(),
            min: MIN_AUDIO_SIZE_BYTES,
        });
    }
    if audio.len() > MAX_AUDIO_SIZE_BYTES {
        return Err(SttError::ChunkTooLarge {
            size: audio.len(),
            max: MAX_AUDIO_SIZE_BYTES,
        });
    }
    // Parameters like ";codecs=opus" don't change the base format.
    let base = content_type
        .split(';')
        .next()
        .unwrap_or("")
        .trim()
        .to_lowercase();
    if !SUPPORTED_CONTENT_TYPES.contains(&base.as_str()) {
        return Err(SttError::UnsupportedFormat(content_type.to_string()));
    }
    Ok(())
}

/// External transcription capability. Implementations must be callable from
/// per-session threads.
pub trait SpeechToText: Send + Sync {
    fn transcribe(
        &self,
        audio: &[u8],
        content_type: &str,
        language: &str,
        chunk_index: u64,
    ) -> Result<TranscriptSegment, SttError>;
}

/// Deepgram pre-recorded transcription over HTTP.
pub struct DeepgramStt {
    agent: ureq::Agent,
    api_key: String,
    model: String,
}

const DEEPGRAM_BASE: &str = "https://api.deepgram.com/v1/listen";

impl DeepgramStt {
    pub fn new(api_key: &str, model: &str) -> Self {
        let config = ureq::Agent::config_builder()
            .timeout_global(Some(std::time::Duration::from_secs(15)))
            .build();
        DeepgramStt {
            agent: config.into(),
            api_key: api_key.to_string(),
            model: model.to_string(),
        }
    }

    fn request_url(&self, language: &str) -> String {
        let mut url = format!(
            "{}?model={}&punctuate=true&smart_format=true",
            DEEPGRAM_BASE, self.model
        );
        // "auto" lets the provider detect the language.
        if language != "auto" && !language.is_empty() {
            let primary = language.split('-').next().unwrap_or(language);
            url.push_str(&format!("&language={}", primary));
        }
        url
    }

    fn extract_transcript(body: &Value) -> (String, f32) {
        let alt = body
            .get("results")
            .and_then(|r| r.get("channels"))
            .and_then(|c| c.get(0))
            .and_then(|c| c.get("alternatives"))
            .and_then(|a| a.get(0));
        let text = alt
            .and_then(|a| a.get("transcript"))
            .and_then(Value::as_str)
            .unwrap_or("")
            .trim()
            .to_string();
        let confidence = alt
            .and_then(|a| a.get("confidence"))
            .and_then(Value::as_f64)
            .unwrap_or(0.0) as f32;
        (text, confidence)
    }
}

impl SpeechToText for DeepgramStt {
    fn transcribe(
        &self,
        audio: &[u8],
        content_type: &str,
        language: &str,
        chunk_index: u64,
    ) -> Result<TranscriptSegment, SttError> {
        validate_audio(audio, content_type)?;

        let url = self.request_url(language);
        let start = Instant::now();

        // Two retries with a short backoff; client errors are not retried.
        let max_retries = 2;
        let mut last_error = String::new();

        for attempt in 0..=max_retries {
            let result = self
                .agent
                .post(&url)
                .header("Authorization", &format!("Token {}", self.api_key))
                .header("Content-Type", content_type)
                .send(audio);

            match result {
                Ok(resp) => {
                    let body: Value = resp
                        .into_body()
                        .read_json()
                        .map_err(|e| SttError::Provider(format!("bad response: {e}")))?;
                    let (text, confidence) = Self::extract_transcript(&body);
                    let duration_ms = start.elapsed().as_secs_f64() * 1000.0;
                    let segment = TranscriptSegment {
                        text,
                        is_final: true,
                        chunk_index,
                        duration_ms: (duration_ms * 10.0).round() / 10.0,
                        confidence,
                    };
                    debug!(
                        "stt chunk #{chunk_index}: '{}' ({:.1}ms, {} bytes, attempt {})",
                        truncate(&segment.text, 80),
                        segment.duration_ms,
                        audio.len(),
                        attempt + 1
                    );
                    return Ok(segment);
                }
                Err(e) => {
                    last_error = e.to_string();
                    // 4xx means the payload is wrong; retrying won't help.
                    if last_error.contains("400") || last_error.contains("invalid") {
                        break;
                    }
                    if attempt < max_retries {
                        let wait = std::time::Duration::from_millis(500 * (1 << attempt));
                        warn!(
                            "stt attempt {} failed, retrying in {:?}: {last_error}",
                            attempt + 1,
                            wait
                        );
                        std::thread::sleep(wait);
                    }
                }
            }
        }

        Err(SttError::Provider(last_error))
    }
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_tiny_and_huge_chunks() {
        assert!(matches!(
            validate_audio(&[0u8; 100], "audio/webm"),
            Err(SttError::ChunkTooSmall { .. })
        ));
        let big = vec![0u8; MAX_AUDIO_SIZE_BYTES + 1];
        assert!(matches!(
            validate_audio(&big, "audio/webm"),
            Err(SttError::ChunkTooLarge { .. })
        ));
    }

    #[test]
    fn content_type_parameters_are_ignored() {
        let ok = vec![0u8; 2000];
        assert!(validate_audio(&ok, "audio/webm;codecs=opus").is_ok());
        assert!(validate_audio(&ok, "audio/pcm;rate=16000").is_ok());
        assert!(matches!(
            validate_audio(&ok, "video/avi"),
            Err(SttError::UnsupportedFormat(_))
        ));
    }

    #[test]
    fn empty_segment_detection() {
        let seg = |text: &str| TranscriptSegment {
            text: text.to_string(),
            is_final: true,
            chunk_index: 0,
            duration_ms: 0.0,
            confidence: 1.0,
        };
        assert!(seg("").is_empty());
        assert!(seg(" . ").is_empty());
        assert!(!seg("next slide").is_empty());
    }

    #[test]
    fn deepgram_response_extraction() {
        let body: Value = serde_json::from_str(
            r#"{"results":{"channels":[{"alternatives":[
                {"transcript":" sonraki slayt ","confidence":0.97}
            ]}]}}"#,
        )
        .unwrap();
        let (text, conf) = DeepgramStt::extract_transcript(&body);
        assert_eq!(text, "sonraki slayt");
        assert!((conf - 0.97).abs() < 1e-6);
    }

    #[test]
    fn language_tag_shortened_in_url() {
        let stt = DeepgramStt::new("key", "nova-2");
        assert!(stt.request_url("tr-TR").ends_with("&language=tr"));
        assert!(!stt.request_url("auto").contains("language="));
    }
}
