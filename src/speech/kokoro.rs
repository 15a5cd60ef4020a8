//! Kokoro speech platform: text → phonemes → ONNX inference → rodio playback.
//!
//! Pipeline per utterance (on its own thread):
//! 1. Text → sentences (split on .!?)
//! 2. Sentence → phonemes (misaki-rs G2P)
//! 3. Phonemes → token IDs (tokenizer.json vocabulary)
//! 4. Token IDs + voice style + speed → ONNX inference → f32 audio (24kHz)
//! 5. Audio → rodio Sink, polled for completion, pause and cancellation
//!
//! Kokoro has no pitch input. Pitch is applied as a playback speed shift, and
//! synthesis runs at `rate / pitch` so the spoken tempo stays at `rate`.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::{Duration, Instant};

use ndarray::{Array2, Array3};
use ndarray_npy::NpzReader;
use ort::value::Tensor;
use rodio::buffer::SamplesBuffer;
use rodio::{OutputStream, OutputStreamBuilder, Sink};
use tracing::{debug, info, warn};

use super::text::split_sentences;
use super::{
    EventCallback, PlatformVoice, SpeechPlatform, Utterance, UtteranceEvent, UtteranceId,
    VoicesChangedCallback,
};
use crate::config::SpeechConfig;
use crate::error::SpeechError;

const SAMPLE_RATE: u32 = 24000;
const MAX_TOKENS: usize = 510; // Voice style array first dimension
const DEFAULT_VOICE: &str = "af_heart";
const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Loaded voice style data: shape (510, 1, 256) f32.
struct VoiceData {
    /// Style vectors indexed by token count. shape: (510, 256)
    styles: Array2<f32>,
}

/// Everything `load` produces. Immutable once built, shared by playback threads.
struct KokoroModel {
    // ort 2.0 Session::run needs &mut
    session: Mutex<ort::session::Session>,
    phonemizer: misaki_rs::G2P,
    vocab: HashMap<char, i64>,
    voices: HashMap<String, VoiceData>,
    // In rodio 0.21, OutputStream is the handle; kept alive for the model's lifetime
    output_stream: OutputStream,
}

/// The utterance currently owning the audio output.
struct Active {
    id: UtteranceId,
    cancelled: Arc<AtomicBool>,
    paused: bool,
    sink: Option<Sink>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LoadState {
    NotLoaded,
    Loading,
    Loaded,
    Failed,
}

/// Native Kokoro implementation of [`SpeechPlatform`].
pub struct KokoroPlatform {
    model_path: PathBuf,
    voices_path: PathBuf,
    tokenizer_path: PathBuf,

    model: RwLock<Option<Arc<KokoroModel>>>,
    load_state: Mutex<LoadState>,
    voices_changed: Mutex<Option<VoicesChangedCallback>>,
    active: Arc<Mutex<Option<Active>>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn path_or(configured: &str, base_dir: &Path, default: &str) -> PathBuf {
    if configured.is_empty() {
        base_dir.join(default)
    } else {
        PathBuf::from(configured)
    }
}

impl KokoroPlatform {
    pub fn new(config: &SpeechConfig) -> Self {
        let base_dir = std::env::current_dir().unwrap_or_default();

        Self {
            model_path: path_or(&config.model_path, &base_dir, "kokoro-v1.0.onnx"),
            voices_path: path_or(&config.voices_path, &base_dir, "voices-v1.0.bin"),
            tokenizer_path: path_or(&config.tokenizer_path, &base_dir, "tokenizer.json"),
            model: RwLock::new(None),
            load_state: Mutex::new(LoadState::NotLoaded),
            voices_changed: Mutex::new(None),
            active: Arc::new(Mutex::new(None)),
        }
    }

    pub fn is_loaded(&self) -> bool {
        *lock(&self.load_state) == LoadState::Loaded
    }

    /// Load the model on a background thread. The voices-changed callback
    /// fires once the voice list is populated.
    pub fn load_in_background(self: &Arc<Self>) {
        {
            let mut state = lock(&self.load_state);
            if matches!(*state, LoadState::Loading | LoadState::Loaded) {
                return;
            }
            *state = LoadState::Loading;
        }

        let platform = Arc::clone(self);
        let spawned = std::thread::Builder::new()
            .name("kokoro-load".into())
            .spawn(move || {
                if let Err(e) = platform.load() {
                    warn!("Failed to load Kokoro TTS: {e}");
                }
            });
        if let Err(e) = spawned {
            warn!("Failed to spawn Kokoro loader thread: {e}");
            *lock(&self.load_state) = LoadState::Failed;
        }
    }

    /// Load the ONNX model, tokenizer, voices, phonemizer and audio output.
    /// Blocking; fires the voices-changed callback on success.
    pub fn load(&self) -> Result<(), SpeechError> {
        *lock(&self.load_state) = LoadState::Loading;
        match self.load_model() {
            Ok(model) => {
                *self.model.write().unwrap_or_else(PoisonError::into_inner) = Some(Arc::new(model));
                *lock(&self.load_state) = LoadState::Loaded;
                let callback = lock(&self.voices_changed).clone();
                if let Some(callback) = callback {
                    callback();
                }
                Ok(())
            }
            Err(e) => {
                *lock(&self.load_state) = LoadState::Failed;
                // Lets anything waiting on voices give up.
                let callback = lock(&self.voices_changed).clone();
                if let Some(callback) = callback {
                    callback();
                }
                Err(SpeechError::Backend(e))
            }
        }
    }

    fn load_model(&self) -> Result<KokoroModel, String> {
        let t0 = Instant::now();

        info!("Loading tokenizer from {}", self.tokenizer_path.display());
        let vocab = load_tokenizer(&self.tokenizer_path)?;
        info!("Tokenizer loaded: {} tokens", vocab.len());

        info!("Loading voices from {}", self.voices_path.display());
        let voices = load_voices(&self.voices_path)?;
        info!("Loaded {} voices", voices.len());

        info!("Loading ONNX model from {}", self.model_path.display());
        let session = ort::session::Session::builder()
            .map_err(|e| format!("Failed to create ONNX session builder: {e}"))?
            .with_optimization_level(ort::session::builder::GraphOptimizationLevel::Level3)
            .map_err(|e| format!("Failed to set optimization level: {e}"))?
            .with_intra_threads(4)
            .map_err(|e| format!("Failed to set thread count: {e}"))?
            .commit_from_file(&self.model_path)
            .map_err(|e| format!("Failed to load ONNX model: {e}"))?;

        let phonemizer = misaki_rs::G2P::new(misaki_rs::Language::EnglishUS);

        let output_stream = OutputStreamBuilder::open_default_stream()
            .map_err(|e| format!("Failed to open audio output: {e}"))?;

        info!("Kokoro TTS loaded in {}ms", t0.elapsed().as_millis());

        Ok(KokoroModel {
            session: Mutex::new(session),
            phonemizer,
            vocab,
            voices,
            output_stream,
        })
    }

    fn loaded_model(&self) -> Option<Arc<KokoroModel>> {
        self.model
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl SpeechPlatform for KokoroPlatform {
    fn is_available(&self) -> bool {
        *lock(&self.load_state) != LoadState::Failed
    }

    fn voices(&self) -> Vec<PlatformVoice> {
        let Some(model) = self.loaded_model() else {
            return Vec::new();
        };
        advertised_voices(model.voices.keys().map(String::as_str))
    }

    fn set_voices_changed(&self, callback: Option<VoicesChangedCallback>) {
        *lock(&self.voices_changed) = callback;
    }

    fn speak(&self, utterance: Utterance, on_event: EventCallback) {
        let Some(model) = self.loaded_model() else {
            on_event(UtteranceEvent::Error("Kokoro model not loaded".into()));
            return;
        };

        let cancelled = Arc::new(AtomicBool::new(false));
        {
            let mut active = lock(&self.active);
            if let Some(previous) = active.take() {
                previous.cancelled.store(true, Ordering::Relaxed);
                if let Some(sink) = previous.sink {
                    sink.stop();
                }
            }
            *active = Some(Active {
                id: utterance.id,
                cancelled: cancelled.clone(),
                paused: false,
                sink: None,
            });
        }

        let id = utterance.id;
        let on_event = Arc::new(Mutex::new(Some(on_event)));
        let spawned = {
            let active = self.active.clone();
            let on_event = on_event.clone();
            std::thread::Builder::new()
                .name(format!("kokoro-utterance-{}", id.0))
                .spawn(move || {
                    let event = run_utterance(&model, &active, &cancelled, &utterance);
                    release(&active, id);
                    if let Some(on_event) = lock(&on_event).take() {
                        on_event(event);
                    }
                })
        };

        if let Err(e) = spawned {
            warn!("Failed to spawn playback thread for utterance {id}: {e}");
            release(&self.active, id);
            if let Some(on_event) = lock(&on_event).take() {
                on_event(UtteranceEvent::Error(format!("failed to start playback: {e}")));
            }
        }
    }

    fn pause(&self) {
        if let Some(active) = lock(&self.active).as_mut() {
            active.paused = true;
            if let Some(sink) = &active.sink {
                sink.pause();
            }
        }
    }

    fn resume(&self) {
        if let Some(active) = lock(&self.active).as_mut() {
            active.paused = false;
            if let Some(sink) = &active.sink {
                sink.play();
            }
        }
    }

    fn cancel(&self) {
        if let Some(active) = lock(&self.active).take() {
            active.cancelled.store(true, Ordering::Relaxed);
            if let Some(sink) = active.sink {
                sink.stop();
            }
            info!("TTS cancelled");
        }
    }

    fn is_speaking(&self) -> bool {
        lock(&self.active).is_some()
    }
}

/// Free the output slot if `id` still owns it.
fn release(active: &Mutex<Option<Active>>, id: UtteranceId) {
    let mut slot = lock(active);
    if slot.as_ref().is_some_and(|a| a.id == id) {
        *slot = None;
    }
}

/// Synthesize and play one utterance, sentence by sentence.
fn run_utterance(
    model: &KokoroModel,
    active: &Mutex<Option<Active>>,
    cancelled: &AtomicBool,
    utterance: &Utterance,
) -> UtteranceEvent {
    let sentences = split_sentences(&utterance.text);
    if sentences.is_empty() {
        return UtteranceEvent::End;
    }

    let voice_name = utterance
        .voice
        .as_ref()
        .map_or(DEFAULT_VOICE, |v| v.name.as_str());
    let pitch = utterance.pitch.clamp(0.5, 2.0);
    let synth_speed = (utterance.rate / pitch).clamp(0.5, 2.0);

    let mut played = 0;
    let mut last_error = None;

    for (i, sentence) in sentences.iter().enumerate() {
        if cancelled.load(Ordering::Relaxed) {
            info!("Cancelled before sentence {}/{}", i + 1, sentences.len());
            return UtteranceEvent::Interrupted;
        }

        let t_gen = Instant::now();
        let samples = match generate_audio(model, sentence, voice_name, synth_speed) {
            Ok(s) => s,
            Err(e) => {
                warn!("TTS generation failed for sentence {}: {e}", i + 1);
                last_error = Some(e);
                continue;
            }
        };
        let gen_ms = t_gen.elapsed().as_secs_f64() * 1000.0;

        if cancelled.load(Ordering::Relaxed) {
            info!("Cancelled after generating sentence {}/{}", i + 1, sentences.len());
            return UtteranceEvent::Interrupted;
        }

        if samples.is_empty() {
            continue;
        }

        let t_play = Instant::now();
        if !play_samples(model, active, utterance, samples, pitch) {
            info!("Cancelled during playback of sentence {}/{}", i + 1, sentences.len());
            return UtteranceEvent::Interrupted;
        }
        played += 1;

        debug!(
            "Sentence {}/{}: gen={gen_ms:.0}ms play={:.1}s",
            i + 1,
            sentences.len(),
            t_play.elapsed().as_secs_f64()
        );
    }

    match last_error {
        Some(e) if played == 0 => UtteranceEvent::Error(e),
        _ => UtteranceEvent::End,
    }
}

/// Play samples and block until done. Returns false if cancelled.
fn play_samples(
    model: &KokoroModel,
    active: &Mutex<Option<Active>>,
    utterance: &Utterance,
    samples: Vec<f32>,
    pitch: f32,
) -> bool {
    // rodio 0.21: Sink::connect_new takes &Mixer
    let sink = Sink::connect_new(model.output_stream.mixer());
    sink.set_volume(utterance.volume);
    sink.set_speed(pitch);
    sink.append(SamplesBuffer::new(1, SAMPLE_RATE, samples));

    {
        let mut slot = lock(active);
        match slot.as_mut() {
            Some(a) if a.id == utterance.id && !a.cancelled.load(Ordering::Relaxed) => {
                if a.paused {
                    sink.pause();
                }
                a.sink = Some(sink);
            }
            _ => {
                sink.stop();
                return false;
            }
        }
    }

    loop {
        {
            let mut slot = lock(active);
            let Some(a) = slot.as_mut().filter(|a| a.id == utterance.id) else {
                return false;
            };
            if a.cancelled.load(Ordering::Relaxed) {
                if let Some(sink) = a.sink.take() {
                    sink.stop();
                }
                return false;
            }
            if a.sink.as_ref().is_none_or(Sink::empty) {
                a.sink = None;
                return true;
            }
        }
        std::thread::sleep(POLL_INTERVAL);
    }
}

/// Generate audio samples for a single sentence.
fn generate_audio(
    model: &KokoroModel,
    text: &str,
    voice_name: &str,
    speed: f32,
) -> Result<Vec<f32>, String> {
    // 1. Text → phonemes via misaki-rs G2P
    let (phonemes, _tokens) = model
        .phonemizer
        .g2p(text)
        .map_err(|e| format!("Phonemization failed: {e}"))?;

    if phonemes.is_empty() {
        return Ok(Vec::new());
    }

    // 2. Phonemes → token IDs, unknown characters skipped
    let mut token_ids: Vec<i64> = Vec::with_capacity(phonemes.len() + 2);
    token_ids.push(0);
    token_ids.extend(phonemes.chars().filter_map(|ch| model.vocab.get(&ch).copied()));
    token_ids.push(0);

    let n_tokens = token_ids.len().min(MAX_TOKENS);
    token_ids.truncate(n_tokens);

    // 3. Voice style vector for this token count
    let voice_data = model
        .voices
        .get(voice_name)
        .ok_or_else(|| format!("Voice not found: {voice_name}"))?;
    let style_idx = (n_tokens.saturating_sub(2)).min(voice_data.styles.nrows() - 1);
    let style_vec: Vec<f32> = voice_data.styles.row(style_idx).to_vec();

    // 4. ONNX input tensors
    let tokens_array = Array2::from_shape_vec((1, n_tokens), token_ids)
        .map_err(|e| format!("Failed to create tokens tensor: {e}"))?;
    let tokens_tensor = Tensor::from_array(tokens_array)
        .map_err(|e| format!("Failed to create tokens ort tensor: {e}"))?;

    let style_array = Array2::from_shape_vec((1, 256), style_vec)
        .map_err(|e| format!("Failed to create style tensor: {e}"))?;
    let style_tensor = Tensor::from_array(style_array)
        .map_err(|e| format!("Failed to create style ort tensor: {e}"))?;

    let speed_tensor = Tensor::from_array(ndarray::Array1::from_vec(vec![speed]))
        .map_err(|e| format!("Failed to create speed ort tensor: {e}"))?;

    // 5. Inference
    let mut session = lock(&model.session);
    let outputs = session
        .run(ort::inputs![
            "tokens" => tokens_tensor,
            "style" => style_tensor,
            "speed" => speed_tensor
        ])
        .map_err(|e| format!("ONNX inference failed: {e}"))?;

    // 6. First output is the waveform; ort 2.0 yields (&Shape, &[T])
    let first_output = outputs.iter().next().ok_or("No output tensor from model")?;
    let (_shape, audio_slice) = first_output
        .1
        .try_extract_tensor::<f32>()
        .map_err(|e| format!("Failed to extract audio tensor: {e}"))?;

    let samples: Vec<f32> = audio_slice.to_vec();
    debug!(
        "Generated {} samples ({:.1}s)",
        samples.len(),
        samples.len() as f32 / SAMPLE_RATE as f32
    );

    Ok(samples)
}

/// Language tag for a Kokoro voice, from its name prefix (`af_heart` → en-US).
///
/// Only English voices are recognised: the phonemizer is built for English,
/// so any other voice would be fed English phonemes.
pub fn voice_lang(name: &str) -> Option<&'static str> {
    match name.chars().next() {
        Some('a') => Some("en-US"),
        Some('b') => Some("en-GB"),
        _ => None,
    }
}

/// Voices the phonemizer can drive, sorted by name.
fn advertised_voices<'a>(names: impl Iterator<Item = &'a str>) -> Vec<PlatformVoice> {
    let mut voices: Vec<PlatformVoice> = names
        .filter_map(|name| {
            let lang = voice_lang(name)?;
            Some(PlatformVoice {
                name: name.to_string(),
                lang: lang.to_string(),
                default: name == DEFAULT_VOICE,
            })
        })
        .collect();
    voices.sort_by(|a, b| a.name.cmp(&b.name));
    voices
}

/// Load tokenizer vocabulary from tokenizer.json.
fn load_tokenizer(path: &Path) -> Result<HashMap<char, i64>, String> {
    let contents =
        fs::read_to_string(path).map_err(|e| format!("Failed to read tokenizer: {e}"))?;
    parse_tokenizer(&contents)
}

fn parse_tokenizer(contents: &str) -> Result<HashMap<char, i64>, String> {
    let data: serde_json::Value = serde_json::from_str(contents)
        .map_err(|e| format!("Failed to parse tokenizer JSON: {e}"))?;

    let vocab = data["model"]["vocab"]
        .as_object()
        .ok_or("Missing model.vocab in tokenizer.json")?;

    let mut map = HashMap::new();
    for (token, id) in vocab {
        let id = id.as_i64().ok_or("Token ID is not an integer")?;
        // Each token should be a single character
        if let Some(ch) = token.chars().next() {
            map.insert(ch, id);
        }
    }

    Ok(map)
}

/// Load all voice styles from an NPZ file.
fn load_voices(path: &Path) -> Result<HashMap<String, VoiceData>, String> {
    let file = fs::File::open(path).map_err(|e| format!("Failed to open voices file: {e}"))?;

    let mut npz =
        NpzReader::new(file).map_err(|e| format!("Failed to read NPZ voices file: {e}"))?;

    let names: Vec<String> = npz
        .names()
        .map_err(|e| format!("Failed to list NPZ entries: {e}"))?
        .into_iter()
        .map(|n| n.trim_end_matches(".npy").to_string())
        .collect();

    let mut voices = HashMap::new();
    for name in names {
        let arr: Array3<f32> = npz
            .by_name(&format!("{name}.npy"))
            .map_err(|e| format!("Failed to read voice '{name}': {e}"))?;

        // Shape is (510, 1, 256). Squeeze the middle dimension to (510, 256).
        let dim0 = arr.shape()[0];
        let dim2 = arr.shape()[2];
        let styles = arr
            .into_shape_with_order((dim0, dim2))
            .map_err(|e| format!("Failed to reshape voice '{name}': {e}"))?;

        voices.insert(name, VoiceData { styles });
    }

    Ok(voices)
}
