//! Scanner-audio ingestion: the cost-control path.
//!
//! Windows of PCM flow through an energy gate (don't transcribe silence),
//! then transcription, then a keyword pre-filter (don't extract routine
//! traffic). Only triggered windows become observations; the overwhelming
//! majority of air time is discarded before the extractor ever sees it.

use std::collections::VecDeque;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{debug, info};

use super::{content_hash, RawObservation};

/// 16 kHz mono windows; ~15 s of audio per window.
pub const SAMPLE_RATE: usize = 16_000;
pub const WINDOW_SECONDS: usize = 15;

/// RMS amplitude (0..=32767) below which a window counts as silence.
/// Scanner squelch noise sits well under this; dispatch speech well over.
pub const SPEECH_RMS_THRESHOLD: f64 = 500.0;

/// High-value triggers that make a transcript worth extracting.
pub const TRIGGER_KEYWORDS: &[&str] = &[
    "shots fired",
    "shooting",
    "stabbing",
    "active shooter",
    "structure fire",
    "house fire",
    "building fire",
    "major accident",
    "fatality",
    "entrapment",
    "pursuit",
    "armed",
    "weapon",
    "missing child",
    "amber alert",
    "missing person",
    "robbery in progress",
    "burglary in progress",
];

/// Transcript snippets kept as rolling context for dispatch continuity.
const CONTEXT_WINDOWS: usize = 3;

#[derive(Debug, Clone)]
pub struct AudioWindow {
    pub samples: Vec<i16>,
    pub captured_at: DateTime<Utc>,
}

/// Source of PCM windows from a scanner stream.
#[async_trait]
pub trait AudioFeed: Send {
    /// Next window, or None when the stream ends.
    async fn next_window(&mut self) -> Result<Option<AudioWindow>>;
}

#[async_trait]
pub trait Transcriber: Send + Sync {
    async fn transcribe(&self, samples: &[i16]) -> Result<String>;
}

/// Whisper-style HTTP transcription endpoint taking raw 16 kHz mono PCM.
pub struct HttpTranscriber {
    client: reqwest::Client,
    url: String,
}

impl HttpTranscriber {
    pub fn new(url: &str, timeout: Duration) -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(timeout)
                .build()
                .expect("Failed to build transcriber HTTP client"),
            url: url.to_string(),
        }
    }
}

#[async_trait]
impl Transcriber for HttpTranscriber {
    async fn transcribe(&self, samples: &[i16]) -> Result<String> {
        let mut bytes = Vec::with_capacity(samples.len() * 2);
        for s in samples {
            bytes.extend_from_slice(&s.to_le_bytes());
        }

        #[derive(serde::Deserialize)]
        struct TranscribeResponse {
            text: String,
        }

        let resp: TranscribeResponse = self
            .client
            .post(&self.url)
            .query(&[("sample_rate", SAMPLE_RATE.to_string())])
            .header("Content-Type", "application/octet-stream")
            .body(bytes)
            .send()
            .await
            .context("Transcription request failed")?
            .error_for_status()
            .context("Transcription endpoint returned error status")?
            .json()
            .await
            .context("Malformed transcription response")?;

        Ok(resp.text)
    }
}

/// Voice-activity gate: RMS energy over the window.
pub fn has_speech(samples: &[i16]) -> bool {
    if samples.is_empty() {
        return false;
    }
    let sum_sq: f64 = samples.iter().map(|&s| (s as f64) * (s as f64)).sum();
    (sum_sq / samples.len() as f64).sqrt() >= SPEECH_RMS_THRESHOLD
}

pub fn keyword_triggered(transcript: &str) -> bool {
    let lower = transcript.to_lowercase();
    TRIGGER_KEYWORDS.iter().any(|kw| lower.contains(kw))
}

/// Counters proving the discard rate; the trigger model only pays for the
/// rare windows that matter.
#[derive(Debug, Default, Clone)]
pub struct AudioStats {
    pub windows_seen: u64,
    pub windows_voiced: u64,
    pub windows_triggered: u64,
}

impl AudioStats {
    /// Fraction of windows that produced no observation.
    pub fn discard_rate(&self) -> f64 {
        if self.windows_seen == 0 {
            return 1.0;
        }
        1.0 - (self.windows_triggered as f64 / self.windows_seen as f64)
    }
}

/// Per-source audio pipeline state: VAD -> transcribe -> keyword gate.
pub struct AudioPipeline {
    transcriber: Box<dyn Transcriber>,
    context: VecDeque<String>,
    stats: AudioStats,
}

impl AudioPipeline {
    pub fn new(transcriber: Box<dyn Transcriber>) -> Self {
        Self {
            transcriber,
            context: VecDeque::new(),
            stats: AudioStats::default(),
        }
    }

    pub fn stats(&self) -> &AudioStats {
        &self.stats
    }

    /// Run one window through the trigger model. Returns an observation only
    /// when the window is voiced and its transcript hits a trigger keyword;
    /// recent non-triggered transcripts ride along as context.
    pub async fn process_window(
        &mut self,
        source_url: &str,
        window: &AudioWindow,
    ) -> Result<Option<RawObservation>> {
        self.stats.windows_seen += 1;

        if !has_speech(&window.samples) {
            return Ok(None);
        }
        self.stats.windows_voiced += 1;

        let transcript = self.transcriber.transcribe(&window.samples).await?;
        if transcript.trim().is_empty() {
            return Ok(None);
        }

        if !keyword_triggered(&transcript) {
            debug!(chars = transcript.len(), "Transcript below trigger, buffering");
            self.push_context(transcript);
            return Ok(None);
        }
        self.stats.windows_triggered += 1;

        let raw_text = if self.context.is_empty() {
            transcript.clone()
        } else {
            let context: Vec<&str> = self.context.iter().map(String::as_str).collect();
            format!("{}\n{}", context.join("\n"), transcript)
        };
        self.push_context(transcript);

        info!(
            source_url,
            triggered = self.stats.windows_triggered,
            seen = self.stats.windows_seen,
            "Scanner window triggered"
        );

        Ok(Some(RawObservation {
            external_id: content_hash(&format!(
                "{}|{}",
                window.captured_at.format("%Y-%m-%dT%H:%M"),
                raw_text
            )),
            source_url: source_url.to_string(),
            raw_text,
            published_at: Some(window.captured_at),
            title: None,
            produced_at: Utc::now(),
        }))
    }

    fn push_context(&mut self, transcript: String) {
        self.context.push_back(transcript);
        while self.context.len() > CONTEXT_WINDOWS {
            self.context.pop_front();
        }
    }
}

/// Chunked HTTP scanner stream, accumulated into fixed-size PCM windows.
pub struct HttpAudioFeed {
    stream: Box<dyn futures::Stream<Item = reqwest::Result<bytes::Bytes>> + Send + Unpin>,
    buffer: Vec<u8>,
}

impl HttpAudioFeed {
    pub async fn connect(url: &str) -> Result<Self> {
        let resp = reqwest::Client::new()
            .get(url)
            .send()
            .await
            .with_context(|| format!("Failed to connect to audio stream {url}"))?
            .error_for_status()
            .context("Audio stream returned error status")?;
        Ok(Self {
            stream: Box::new(resp.bytes_stream()),
            buffer: Vec::new(),
        })
    }
}

#[async_trait]
impl AudioFeed for HttpAudioFeed {
    async fn next_window(&mut self) -> Result<Option<AudioWindow>> {
        use futures::StreamExt;

        let window_bytes = SAMPLE_RATE * WINDOW_SECONDS * 2;
        while self.buffer.len() < window_bytes {
            match self.stream.next().await {
                Some(chunk) => {
                    let chunk = chunk.context("Audio stream read failed")?;
                    self.buffer.extend_from_slice(&chunk);
                }
                None => return Ok(None),
            }
        }

        let rest = self.buffer.split_off(window_bytes);
        let bytes = std::mem::replace(&mut self.buffer, rest);
        let samples = bytes
            .chunks_exact(2)
            .map(|b| i16::from_le_bytes([b[0], b[1]]))
            .collect();
        Ok(Some(AudioWindow {
            samples,
            captured_at: Utc::now(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct ScriptedTranscriber {
        lines: std::sync::Mutex<VecDeque<String>>,
    }

    impl ScriptedTranscriber {
        fn new(lines: Vec<&str>) -> Self {
            Self {
                lines: std::sync::Mutex::new(lines.into_iter().map(String::from).collect()),
            }
        }
    }

    #[async_trait]
    impl Transcriber for ScriptedTranscriber {
        async fn transcribe(&self, _samples: &[i16]) -> Result<String> {
            Ok(self
                .lines
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_default())
        }
    }

    fn silence() -> AudioWindow {
        AudioWindow {
            samples: vec![0i16; SAMPLE_RATE],
            captured_at: Utc::now(),
        }
    }

    fn voiced() -> AudioWindow {
        // Square wave well above the energy threshold.
        AudioWindow {
            samples: (0..SAMPLE_RATE)
                .map(|i| if i % 2 == 0 { 4000 } else { -4000 })
                .collect(),
            captured_at: Utc::now(),
        }
    }

    #[test]
    fn vad_separates_silence_from_speech() {
        assert!(!has_speech(&silence().samples));
        assert!(has_speech(&voiced().samples));
        assert!(!has_speech(&[]));
    }

    #[test]
    fn keywords_trigger_case_insensitively() {
        assert!(keyword_triggered("Engine 5 responding, STRUCTURE FIRE on Oak"));
        assert!(keyword_triggered("shots fired 100 block north main"));
        assert!(!keyword_triggered("traffic stop, plate check, all clear"));
    }

    #[tokio::test]
    async fn most_windows_are_discarded_before_extraction() {
        // 20 voiced windows of routine traffic, one trigger; plus 80 silent
        // windows. Only the trigger may produce an observation.
        let mut lines: Vec<&str> = vec!["unit 12 routine patrol check"; 19];
        lines.push("shots fired near the depot, two callers");
        let mut pipeline = AudioPipeline::new(Box::new(ScriptedTranscriber::new(lines)));

        let mut observations = 0;
        for _ in 0..80 {
            if pipeline
                .process_window("https://scanner.test/feed", &silence())
                .await
                .unwrap()
                .is_some()
            {
                observations += 1;
            }
        }
        for _ in 0..20 {
            if pipeline
                .process_window("https://scanner.test/feed", &voiced())
                .await
                .unwrap()
                .is_some()
            {
                observations += 1;
            }
        }

        assert_eq!(observations, 1);
        let stats = pipeline.stats();
        assert_eq!(stats.windows_seen, 100);
        assert_eq!(stats.windows_voiced, 20);
        assert_eq!(stats.windows_triggered, 1);
        assert!(
            stats.discard_rate() >= 0.9,
            "discard rate {}",
            stats.discard_rate()
        );
    }

    #[tokio::test]
    async fn triggered_transcript_carries_rolling_context() {
        let lines = vec![
            "engine 5 staging at oak and main",
            "second caller reports smoke",
            "confirmed structure fire, oak and main",
        ];
        let mut pipeline = AudioPipeline::new(Box::new(ScriptedTranscriber::new(lines)));

        assert!(pipeline
            .process_window("u", &voiced())
            .await
            .unwrap()
            .is_none());
        assert!(pipeline
            .process_window("u", &voiced())
            .await
            .unwrap()
            .is_none());
        let obs = pipeline
            .process_window("u", &voiced())
            .await
            .unwrap()
            .expect("trigger window produces an observation");

        assert!(obs.raw_text.contains("staging at oak"));
        assert!(obs.raw_text.contains("confirmed structure fire"));
    }
}
