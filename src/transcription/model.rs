//! # Whisper Model
//!
//! Candle-rs implementation of the speech engine.
//!
//! ## Model Loading Process:
//! 1. Download `config.json`, `tokenizer.json` and `model.safetensors` from
//!    HuggingFace (cached locally by hf-hub)
//! 2. Resolve the special tokens from the tokenizer
//! 3. Build a Slaney-normalized mel filter bank for the model's mel bin count
//! 4. Memory-map the weights onto the selected device
//!
//! ## Inference:
//! Audio is padded to Whisper's 30 second window, converted to a log-mel
//! spectrogram, encoded once, then decoded greedily until end-of-text. When no
//! language is configured the decoder's first step picks one.

use crate::device::{device_label, DevicePreference};
use crate::error::EngineError;
use crate::transcription::engine::{EngineOutput, ModelLoader, SpeechModel};
use anyhow::{anyhow, Result};
use candle_core::{Device, IndexOp, Tensor};
use candle_nn::VarBuilder;
use candle_transformers::models::whisper::{self as m, Config};
use futures_util::future::BoxFuture;
use tokenizers::Tokenizer;

/// Languages considered during detection, in Whisper's token order.
const LANGUAGES: &[&str] = &[
    "en", "zh", "de", "es", "ru", "ko", "fr", "ja", "pt", "tr", "pl", "ca", "nl", "ar", "sv",
    "it", "id", "hi", "fi", "vi", "he", "uk", "el", "ms", "cs", "ro", "da", "hu", "ta", "no",
];

/// Available Whisper model sizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum ModelSize {
    Tiny,
    Base,
    Small,
    Medium,
    Large,
}

impl ModelSize {
    /// HuggingFace repository holding the weights.
    pub fn repo_name(&self) -> &'static str {
        match self {
            ModelSize::Tiny => "openai/whisper-tiny",
            ModelSize::Base => "openai/whisper-base",
            ModelSize::Small => "openai/whisper-small",
            ModelSize::Medium => "openai/whisper-medium",
            ModelSize::Large => "openai/whisper-large-v2",
        }
    }

    /// Approximate download size in MB.
    pub fn size_mb(&self) -> u32 {
        match self {
            ModelSize::Tiny => 39,
            ModelSize::Base => 74,
            ModelSize::Small => 244,
            ModelSize::Medium => 769,
            ModelSize::Large => 1550,
        }
    }
}

impl std::str::FromStr for ModelSize {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "tiny" => Ok(ModelSize::Tiny),
            "base" => Ok(ModelSize::Base),
            "small" => Ok(ModelSize::Small),
            "medium" => Ok(ModelSize::Medium),
            "large" => Ok(ModelSize::Large),
            _ => Err(anyhow!("Unknown model size: {}", s)),
        }
    }
}

impl std::fmt::Display for ModelSize {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ModelSize::Tiny => "tiny",
            ModelSize::Base => "base",
            ModelSize::Small => "small",
            ModelSize::Medium => "medium",
            ModelSize::Large => "large",
        };
        write!(f, "{}", name)
    }
}

#[derive(Debug, Clone, Copy)]
struct SpecialTokens {
    sot: u32,
    transcribe: u32,
    eot: u32,
    no_timestamps: u32,
}

impl SpecialTokens {
    fn resolve(tokenizer: &Tokenizer) -> Result<Self> {
        let id = |token: &str| {
            tokenizer
                .token_to_id(token)
                .ok_or_else(|| anyhow!("Tokenizer has no id for {}", token))
        };
        Ok(Self {
            sot: id(m::SOT_TOKEN)?,
            transcribe: id(m::TRANSCRIBE_TOKEN)?,
            eot: id(m::EOT_TOKEN)?,
            no_timestamps: id(m::NO_TIMESTAMPS_TOKEN)?,
        })
    }
}

/// A loaded Whisper model ready for transcription.
pub struct WhisperModel {
    name: String,
    model: m::model::Whisper,
    config: Config,
    device: Device,
    tokenizer: Tokenizer,
    tokens: SpecialTokens,
    mel_filters: Vec<f32>,
    language: Option<String>,
}

impl WhisperModel {
    /// Download (or reuse cached) model files and build the model.
    pub async fn load(size: ModelSize, device: Device, language: Option<String>) -> Result<Self> {
        tracing::info!("Loading Whisper {} model on {}...", size, device_label(&device));
        let start_time = std::time::Instant::now();

        let api = hub_api()?;
        let repo = api.model(size.repo_name().to_string());

        let config_filename = repo
            .get("config.json")
            .await
            .map_err(|e| anyhow!("Failed to download config.json from {}: {}", size.repo_name(), e))?;
        let tokenizer_filename = repo
            .get("tokenizer.json")
            .await
            .map_err(|e| anyhow!("Failed to download tokenizer.json from {}: {}", size.repo_name(), e))?;
        let model_filename = repo
            .get("model.safetensors")
            .await
            .map_err(|e| anyhow!("Failed to download model weights from {}: {}", size.repo_name(), e))?;

        let config: Config = serde_json::from_reader(std::fs::File::open(config_filename)?)?;
        tracing::debug!("Model config: {:?}", config);

        let tokenizer = Tokenizer::from_file(tokenizer_filename)
            .map_err(|e| anyhow!("Failed to load tokenizer: {}", e))?;
        let tokens = SpecialTokens::resolve(&tokenizer)?;
        let mel_filters = mel_filter_bank(config.num_mel_bins, m::N_FFT, m::SAMPLE_RATE);

        // Weight mapping is blocking file I/O
        let model = {
            let device = device.clone();
            let config = config.clone();
            tokio::task::spawn_blocking(move || -> Result<m::model::Whisper> {
                let vb = unsafe {
                    VarBuilder::from_mmaped_safetensors(&[model_filename], m::DTYPE, &device)?
                };
                Ok(m::model::Whisper::load(&vb, config)?)
            })
            .await
            .map_err(|e| anyhow!("Model loading task failed: {}", e))??
        };

        tracing::info!(
            "Whisper {} model loaded in {:.2}s",
            size,
            start_time.elapsed().as_secs_f64()
        );

        Ok(Self {
            name: format!("whisper-{}", size),
            model,
            config,
            device,
            tokenizer,
            tokens,
            mel_filters,
            language,
        })
    }

    /// Log-mel spectrogram of at most one 30 second window, zero padded.
    fn mel(&self, window: &[f32]) -> Result<Tensor, EngineError> {
        let mut padded = window.to_vec();
        padded.resize(m::N_SAMPLES, 0.0);

        let mel = m::audio::pcm_to_mel(&self.config, &padded, &self.mel_filters);
        let n_mels = self.config.num_mel_bins;
        let frames = mel.len() / n_mels;
        let mel = Tensor::from_vec(mel, (1, n_mels, frames), &self.device)?;
        Ok(mel.narrow(2, 0, frames.min(m::N_FRAMES))?)
    }

    fn detect_language(&mut self, features: &Tensor) -> Result<Option<String>, EngineError> {
        let candidates: Vec<(&str, u32)> = LANGUAGES
            .iter()
            .filter_map(|code| {
                self.tokenizer
                    .token_to_id(&format!("<|{}|>", code))
                    .map(|id| (*code, id))
            })
            .collect();
        if candidates.is_empty() {
            return Ok(None);
        }

        let input = Tensor::new(&[[self.tokens.sot]], &self.device)?;
        let ys = self.model.decoder.forward(&input, features, true)?;
        let logits = self.model.decoder.final_linear(&ys.i(..1)?)?.i(0)?.i(0)?;

        let ids: Vec<u32> = candidates.iter().map(|(_, id)| *id).collect();
        let ids = Tensor::new(ids.as_slice(), &self.device)?;
        let best = logits.index_select(&ids, 0)?.argmax(0)?.to_scalar::<u32>()? as usize;

        Ok(candidates.get(best).map(|(code, _)| code.to_string()))
    }

    fn decode(&mut self, features: &Tensor, language: Option<&str>) -> Result<String, EngineError> {
        let mut tokens = vec![self.tokens.sot];
        if let Some(lang) = language {
            if let Some(id) = self.tokenizer.token_to_id(&format!("<|{}|>", lang)) {
                tokens.push(id);
            }
        }
        tokens.push(self.tokens.transcribe);
        tokens.push(self.tokens.no_timestamps);
        let prefix = tokens.len();

        let max_len = self.config.max_target_positions / 2;
        for i in 0..max_len {
            let input = Tensor::new(tokens.as_slice(), &self.device)?.unsqueeze(0)?;
            let ys = self.model.decoder.forward(&input, features, i == 0)?;
            let (_, seq_len, _) = ys.dims3()?;
            let logits = self
                .model
                .decoder
                .final_linear(&ys.i((..1, seq_len - 1..))?)?
                .i(0)?
                .i(0)?;
            let next = logits.argmax(0)?.to_scalar::<u32>()?;

            if next == self.tokens.eot || is_repetitive(&tokens[prefix..], next) {
                break;
            }
            tokens.push(next);
        }

        let text = self
            .tokenizer
            .decode(&tokens[prefix..], true)
            .map_err(|e| EngineError::Inference(format!("Tokenizer decode error: {}", e)))?;
        Ok(text.trim().to_string())
    }
}

impl SpeechModel for WhisperModel {
    fn name(&self) -> &str {
        &self.name
    }

    fn transcribe(&mut self, samples: &[f32]) -> Result<EngineOutput, EngineError> {
        if samples.is_empty() {
            return Ok(EngineOutput::new("", self.language.clone()));
        }

        let mut language = self.language.clone();
        let mut texts = Vec::new();
        for window in samples.chunks(m::N_SAMPLES) {
            let mel = self.mel(window)?;
            let features = self.model.encoder.forward(&mel, true)?;
            if language.is_none() {
                language = self.detect_language(&features)?;
            }
            let text = self.decode(&features, language.as_deref())?;
            if !text.trim().is_empty() {
                texts.push(text.trim().to_string());
            }
        }

        Ok(EngineOutput::new(texts.join(" "), language))
    }
}

/// Greedy decoding can loop on one token or a short phrase.
fn is_repetitive(tokens: &[u32], next: u32) -> bool {
    let n = tokens.len();
    if n >= 3 && tokens[n - 3..].iter().all(|&t| t == next) {
        return true;
    }
    n >= 6 && tokens[n - 3..] == tokens[n - 6..n - 3] && tokens[n - 3] == next
}

fn hub_api() -> Result<hf_hub::api::tokio::Api> {
    use hf_hub::api::tokio::{Api, ApiBuilder};

    let mut builder = ApiBuilder::new().with_progress(false);
    builder = builder.with_token(std::env::var("HF_TOKEN").ok());

    if let Ok(cache_dir) = std::env::var("HF_HUB_CACHE") {
        builder = builder.with_cache_dir(cache_dir.into());
    } else if let Ok(hf_home) = std::env::var("HF_HOME") {
        builder = builder.with_cache_dir(std::path::PathBuf::from(hf_home).join("hub"));
    }

    match builder.build() {
        Ok(api) => Ok(api),
        Err(e) => {
            tracing::warn!("ApiBuilder failed: {}, falling back to Api::new()", e);
            Api::new().map_err(|e2| anyhow!("HuggingFace API unavailable: {}; {}", e, e2))
        }
    }
}

/// Slaney-style mel filter bank, laid out as `n_mels` rows of `n_fft / 2 + 1` weights.
pub fn mel_filter_bank(n_mels: usize, n_fft: usize, sample_rate: usize) -> Vec<f32> {
    const F_SP: f64 = 200.0 / 3.0;
    const MIN_LOG_HZ: f64 = 1000.0;
    let min_log_mel = MIN_LOG_HZ / F_SP;
    let log_step = (6.4f64).ln() / 27.0;

    let hz_to_mel = |hz: f64| {
        if hz >= MIN_LOG_HZ {
            min_log_mel + (hz / MIN_LOG_HZ).ln() / log_step
        } else {
            hz / F_SP
        }
    };
    let mel_to_hz = |mel: f64| {
        if mel >= min_log_mel {
            MIN_LOG_HZ * (log_step * (mel - min_log_mel)).exp()
        } else {
            mel * F_SP
        }
    };

    let n_freqs = n_fft / 2 + 1;
    let fft_freqs: Vec<f64> = (0..n_freqs)
        .map(|k| k as f64 * sample_rate as f64 / n_fft as f64)
        .collect();

    let max_mel = hz_to_mel(sample_rate as f64 / 2.0);
    let mel_points: Vec<f64> = (0..n_mels + 2)
        .map(|i| mel_to_hz(max_mel * i as f64 / (n_mels + 1) as f64))
        .collect();

    let mut filters = vec![0.0f32; n_mels * n_freqs];
    for i in 0..n_mels {
        let (lower, center, upper) = (mel_points[i], mel_points[i + 1], mel_points[i + 2]);
        let norm = 2.0 / (upper - lower);
        for (k, &freq) in fft_freqs.iter().enumerate() {
            let rising = (freq - lower) / (center - lower);
            let falling = (upper - freq) / (upper - center);
            let weight = rising.min(falling).max(0.0);
            filters[i * n_freqs + k] = (weight * norm) as f32;
        }
    }
    filters
}

/// Builds `WhisperModel` instances for the engine pool.
pub struct WhisperLoader {
    size: ModelSize,
    device: DevicePreference,
    language: Option<String>,
}

impl WhisperLoader {
    pub fn new(size: ModelSize, device: DevicePreference, language: Option<String>) -> Self {
        Self {
            size,
            device,
            language,
        }
    }
}

impl ModelLoader for WhisperLoader {
    fn describe(&self) -> String {
        format!(
            "whisper-{} (~{}MB) on {:?}",
            self.size,
            self.size.size_mb(),
            self.device
        )
    }

    fn load(&self) -> BoxFuture<'_, Result<Box<dyn SpeechModel>, EngineError>> {
        Box::pin(async move {
            let device = self.device.select();
            WhisperModel::load(self.size, device, self.language.clone())
                .await
                .map(|model| Box::new(model) as Box<dyn SpeechModel>)
                .map_err(|e| EngineError::Load(e.to_string()))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_model_size_parsing() {
        assert_eq!("medium".parse::<ModelSize>().unwrap(), ModelSize::Medium);
        assert_eq!("LARGE".parse::<ModelSize>().unwrap(), ModelSize::Large);
        assert!("invalid".parse::<ModelSize>().is_err());
    }

    #[test]
    fn test_mel_filter_bank_shape() {
        let filters = mel_filter_bank(80, 400, 16000);
        assert_eq!(filters.len(), 80 * 201);
        assert!(filters.iter().all(|w| *w >= 0.0));

        // Every band covers at least one frequency bin
        for band in filters.chunks(201) {
            assert!(band.iter().any(|w| *w > 0.0));
        }
    }

    #[test]
    fn test_repetition_guard() {
        assert!(is_repetitive(&[7, 7, 7], 7));
        assert!(!is_repetitive(&[7, 7, 8], 7));
        assert!(is_repetitive(&[1, 2, 3, 1, 2, 3], 1));
        assert!(!is_repetitive(&[1, 2, 3, 4, 5, 6], 1));
    }

    #[test]
    fn test_loader_description() {
        let loader = WhisperLoader::new(ModelSize::Tiny, DevicePreference::Cpu, None);
        assert_eq!(loader.describe(), "whisper-tiny (~39MB) on Cpu");
    }
}
