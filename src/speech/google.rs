//! Google Cloud Text-to-Speech (`text:synthesize`).

use async_trait::async_trait;
use base64::Engine;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::{chunk_text, voice_candidates, Rendering, SpeechRenderer};
use crate::error::{classify_status, classify_transport, ServiceError};
use crate::gcp_auth::TokenSource;
use crate::schema::AudioEncoding;

const SYNTHESIZE_URL: &str = "https://texttospeech.googleapis.com/v1/text:synthesize";

/// The service rejects inputs over 5000 bytes; stay under it.
const MAX_INPUT_BYTES: usize = 4500;

const SAMPLE_RATE_HZ: u32 = 24_000;

/// Google's MP3 output is 32 kbps.
const MP3_BYTES_PER_SECOND: u64 = 32_000 / 8;

pub struct GoogleTts {
    client: reqwest::Client,
    tokens: TokenSource,
    project_id: Option<String>,
    preferred_voice_suffix: Option<String>,
}

impl GoogleTts {
    pub fn new(
        client: reqwest::Client,
        tokens: TokenSource,
        project_id: Option<String>,
        preferred_voice_suffix: Option<String>,
    ) -> Self {
        Self {
            client,
            tokens,
            project_id,
            preferred_voice_suffix,
        }
    }

    async fn synthesize(
        &self,
        text: &str,
        locale: &str,
        voice: Option<&str>,
        encoding: AudioEncoding,
    ) -> Result<Vec<u8>, ServiceError> {
        let token = self.tokens.access_token(&self.client).await?;
        let body = SynthesizeRequest {
            input: SynthesisInput { text },
            voice: VoiceParams {
                language_code: locale,
                name: voice,
            },
            audio_config: AudioConfig {
                audio_encoding: encoding.api_name(),
                sample_rate_hertz: SAMPLE_RATE_HZ,
            },
        };

        let mut request = self.client.post(SYNTHESIZE_URL).bearer_auth(token).json(&body);
        if let Some(project) = &self.project_id {
            request = request.header("x-goog-user-project", project);
        }

        let response = request.send().await.map_err(|e| classify_transport(&e))?;
        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_default();
            return Err(classify_synthesis_error(status, &error_text));
        }

        let response: SynthesizeResponse = response
            .json()
            .await
            .map_err(|e| ServiceError::InvalidResponse(format!("TTS response: {e}")))?;
        base64::engine::general_purpose::STANDARD
            .decode(response.audio_content)
            .map_err(|e| ServiceError::InvalidResponse(format!("TTS audio is not base64: {e}")))
    }

    async fn render_with_voice(
        &self,
        chunks: &[String],
        locale: &str,
        voice: Option<&str>,
        encoding: AudioEncoding,
    ) -> Result<Vec<u8>, ServiceError> {
        let mut parts = Vec::with_capacity(chunks.len());
        for chunk in chunks {
            parts.push(self.synthesize(chunk, locale, voice, encoding).await?);
        }
        Ok(join_audio(encoding, parts))
    }
}

#[async_trait]
impl SpeechRenderer for GoogleTts {
    fn name(&self) -> &str {
        "google-tts"
    }

    async fn render(
        &self,
        text: &str,
        locale: &str,
        voice: Option<&str>,
        encoding: AudioEncoding,
    ) -> Result<Rendering, ServiceError> {
        let chunks = chunk_text(text, MAX_INPUT_BYTES);
        if chunks.is_empty() {
            return Err(ServiceError::InvalidRequest("nothing to synthesize".into()));
        }

        let candidates = voice_candidates(locale, voice, self.preferred_voice_suffix.as_deref());
        let mut last_error = None;
        for candidate in &candidates {
            match self
                .render_with_voice(&chunks, locale, candidate.as_deref(), encoding)
                .await
            {
                Ok(audio) => {
                    let duration_ms = estimate_duration_ms(encoding, &audio);
                    let voice = candidate.clone().unwrap_or_else(|| "default".to_string());
                    info!(
                        "GoogleTts: {} chunks, {} bytes, ~{}ms ({}, {})",
                        chunks.len(),
                        audio.len(),
                        duration_ms,
                        locale,
                        voice
                    );
                    return Ok(Rendering {
                        audio,
                        duration_ms,
                        voice,
                    });
                }
                Err(ServiceError::UnsupportedVoice(detail)) => {
                    warn!("GoogleTts: voice {:?} unavailable: {}", candidate, detail);
                    last_error = Some(ServiceError::UnsupportedVoice(detail));
                }
                Err(other) => return Err(other),
            }
        }
        Err(last_error
            .unwrap_or_else(|| ServiceError::UnsupportedVoice(format!("no voice for {locale}"))))
    }
}

/// A 400 that names the voice or language means the voice cannot be used.
fn classify_synthesis_error(status: reqwest::StatusCode, body: &str) -> ServiceError {
    if status == reqwest::StatusCode::BAD_REQUEST {
        let lower = body.to_ascii_lowercase();
        if lower.contains("voice") || lower.contains("language code") {
            return ServiceError::UnsupportedVoice(body.chars().take(300).collect());
        }
    }
    classify_status(status, body)
}

/// MP3 frames concatenate cleanly. LINEAR16 responses each carry a WAV
/// header, so the PCM is merged under a single new header.
fn join_audio(encoding: AudioEncoding, parts: Vec<Vec<u8>>) -> Vec<u8> {
    match encoding {
        AudioEncoding::Mp3 => parts.concat(),
        AudioEncoding::Linear16 => {
            if parts.len() == 1 {
                return parts.into_iter().next().unwrap_or_default();
            }
            let pcm: Vec<u8> = parts.iter().flat_map(|p| wav_pcm(p).iter().copied()).collect();
            let mut out = wav_header(pcm.len() as u32);
            out.extend_from_slice(&pcm);
            out
        }
    }
}

/// PCM payload of a WAV file, or the input unchanged if it has no header.
fn wav_pcm(bytes: &[u8]) -> &[u8] {
    if bytes.len() < 12 || &bytes[..4] != b"RIFF" || &bytes[8..12] != b"WAVE" {
        return bytes;
    }
    let mut offset = 12;
    while offset + 8 <= bytes.len() {
        let id = &bytes[offset..offset + 4];
        let size = u32::from_le_bytes([
            bytes[offset + 4],
            bytes[offset + 5],
            bytes[offset + 6],
            bytes[offset + 7],
        ]) as usize;
        let body = offset + 8;
        if id == b"data" {
            return &bytes[body..(body + size).min(bytes.len())];
        }
        offset = body + size + (size & 1);
    }
    bytes
}

fn wav_header(data_len: u32) -> Vec<u8> {
    let channels: u16 = 1;
    let bits: u16 = 16;
    let block_align = channels * bits / 8;
    let byte_rate = SAMPLE_RATE_HZ * block_align as u32;

    let mut header = Vec::with_capacity(44);
    header.extend_from_slice(b"RIFF");
    header.extend_from_slice(&(36 + data_len).to_le_bytes());
    header.extend_from_slice(b"WAVEfmt ");
    header.extend_from_slice(&16u32.to_le_bytes());
    header.extend_from_slice(&1u16.to_le_bytes());
    header.extend_from_slice(&channels.to_le_bytes());
    header.extend_from_slice(&SAMPLE_RATE_HZ.to_le_bytes());
    header.extend_from_slice(&byte_rate.to_le_bytes());
    header.extend_from_slice(&block_align.to_le_bytes());
    header.extend_from_slice(&bits.to_le_bytes());
    header.extend_from_slice(b"data");
    header.extend_from_slice(&data_len.to_le_bytes());
    header
}

fn estimate_duration_ms(encoding: AudioEncoding, audio: &[u8]) -> u64 {
    match encoding {
        AudioEncoding::Mp3 => audio.len() as u64 * 1000 / MP3_BYTES_PER_SECOND,
        AudioEncoding::Linear16 => {
            let pcm = wav_pcm(audio).len() as u64;
            pcm * 1000 / (SAMPLE_RATE_HZ as u64 * 2)
        }
    }
}

// ============================================================================
// Request/Response types
// ============================================================================

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SynthesizeRequest<'a> {
    input: SynthesisInput<'a>,
    voice: VoiceParams<'a>,
    audio_config: AudioConfig,
}

#[derive(Serialize)]
struct SynthesisInput<'a> {
    text: &'a str,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct VoiceParams<'a> {
    language_code: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    name: Option<&'a str>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct AudioConfig {
    audio_encoding: &'static str,
    sample_rate_hertz: u32,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SynthesizeResponse {
    audio_content: String,
}
