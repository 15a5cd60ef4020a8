//! Speech controller: one current utterance, owned by the controller.
//!
//! Starting playback always cancels what came before. When the platform has
//! not enumerated its voices yet, the newest utterance is parked and started
//! from the platform's voices-changed notification.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use super::text::clean_text;
use super::{
    EventCallback, PlatformVoice, SpeechPlatform, Utterance, UtteranceEvent, UtteranceId,
    VoiceName,
};
use crate::error::SpeechError;

const VOLUME: f32 = 1.0;

pub type EndCallback = Box<dyn FnOnce() + Send>;

struct Pending {
    id: UtteranceId,
    text: String,
    voice: VoiceName,
    on_event: EventCallback,
}

#[derive(Default)]
struct State {
    next_id: u64,
    current: Option<UtteranceId>,
    pending: Option<Pending>,
}

fn lock(state: &Mutex<State>) -> MutexGuard<'_, State> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

pub struct SpeechController {
    platform: Arc<dyn SpeechPlatform>,
    state: Arc<Mutex<State>>,
}

impl SpeechController {
    pub fn new(platform: Arc<dyn SpeechPlatform>) -> Self {
        let state = Arc::new(Mutex::new(State::default()));

        let weak_state = Arc::downgrade(&state);
        let weak_platform = Arc::downgrade(&platform);
        platform.set_voices_changed(Some(Arc::new(move || {
            if let (Some(state), Some(platform)) = (weak_state.upgrade(), weak_platform.upgrade()) {
                start_pending(&state, platform.as_ref());
            }
        })));

        Self { platform, state }
    }

    /// Speak `text` with `voice`. `on_end` runs only if playback completes.
    ///
    /// Playback errors are logged and clear the current utterance; they are
    /// not reported through `on_end`. Use [`Self::speak_to_end`] to observe them.
    pub fn speak(
        &self,
        text: &str,
        voice: VoiceName,
        on_end: Option<EndCallback>,
    ) -> Result<UtteranceId, SpeechError> {
        self.start(
            text,
            voice,
            Box::new(move |event| {
                if event == UtteranceEvent::End {
                    if let Some(on_end) = on_end {
                        on_end();
                    }
                }
            }),
        )
    }

    /// Speak `text` and wait until playback finishes.
    pub async fn speak_to_end(&self, text: &str, voice: VoiceName) -> Result<(), SpeechError> {
        let (tx, rx) = oneshot::channel();
        self.start(
            text,
            voice,
            Box::new(move |event| {
                let _ = tx.send(event);
            }),
        )?;

        match rx.await {
            Ok(UtteranceEvent::End) => Ok(()),
            Ok(UtteranceEvent::Error(message)) => Err(SpeechError::Playback(message)),
            // A dropped sender means the parked utterance was superseded.
            Ok(UtteranceEvent::Interrupted) | Err(_) => Err(SpeechError::Interrupted),
        }
    }

    pub fn pause(&self) {
        self.platform.pause();
    }

    pub fn resume(&self) {
        self.platform.resume();
    }

    pub fn stop(&self) {
        self.platform.cancel();
        let mut state = lock(&self.state);
        state.current = None;
        state.pending = None;
    }

    pub fn is_speaking(&self) -> bool {
        self.platform.is_speaking()
    }

    pub fn current_utterance(&self) -> Option<UtteranceId> {
        lock(&self.state).current
    }

    fn start(
        &self,
        text: &str,
        voice: VoiceName,
        on_event: EventCallback,
    ) -> Result<UtteranceId, SpeechError> {
        if !self.platform.is_available() {
            warn!("Speech synthesis is not available");
            return Err(SpeechError::Unsupported);
        }

        let text = clean_text(text);

        let id = {
            let mut state = lock(&self.state);
            state.next_id += 1;
            let id = UtteranceId(state.next_id);
            state.current = Some(id);
            state.pending = None;
            id
        };

        // After the overwrite, so the old utterance's event cannot clear the new id.
        self.platform.cancel();

        let voices = self.platform.voices();
        if voices.is_empty() {
            debug!("No voices yet, parking utterance {id}");
            lock(&self.state).pending = Some(Pending {
                id,
                text,
                voice,
                on_event,
            });
            // Voices may have arrived, or loading failed, between the check and parking.
            if !self.platform.is_available() || !self.platform.voices().is_empty() {
                start_pending(&self.state, self.platform.as_ref());
            }
            return Ok(id);
        }

        begin(&self.state, self.platform.as_ref(), id, text, voice, &voices, on_event);
        Ok(id)
    }
}

impl Drop for SpeechController {
    fn drop(&mut self) {
        self.platform.set_voices_changed(None);
    }
}

/// Pick the first voice whose language matches `lang`, else the first voice.
pub fn select_voice<'a>(voices: &'a [PlatformVoice], lang: &str) -> Option<&'a PlatformVoice> {
    let wanted = normalize_lang(lang);
    voices
        .iter()
        .find(|v| normalize_lang(&v.lang) == wanted)
        .or_else(|| voices.first())
}

fn normalize_lang(lang: &str) -> String {
    lang.trim().replace('_', "-").to_ascii_lowercase()
}

fn start_pending(state: &Arc<Mutex<State>>, platform: &dyn SpeechPlatform) {
    if !platform.is_available() {
        let pending = {
            let mut state = lock(state);
            let pending = state.pending.take();
            if pending.as_ref().is_some_and(|p| state.current == Some(p.id)) {
                state.current = None;
            }
            pending
        };
        if let Some(pending) = pending {
            warn!("Speech platform became unavailable, dropping utterance {}", pending.id);
            (pending.on_event)(UtteranceEvent::Error("speech platform unavailable".into()));
        }
        return;
    }

    let voices = platform.voices();
    if voices.is_empty() {
        return;
    }
    let Some(pending) = lock(state).pending.take() else {
        return;
    };
    debug!("Voices available ({}), starting parked utterance {}", voices.len(), pending.id);
    begin(
        state,
        platform,
        pending.id,
        pending.text,
        pending.voice,
        &voices,
        pending.on_event,
    );
}

fn begin(
    state: &Arc<Mutex<State>>,
    platform: &dyn SpeechPlatform,
    id: UtteranceId,
    text: String,
    voice: VoiceName,
    voices: &[PlatformVoice],
    on_event: EventCallback,
) {
    let profile = voice.profile();
    let selected = select_voice(voices, profile.lang).cloned();

    info!(
        "Speaking utterance {id} ({} chars, voice={voice}, platform voice={})",
        text.len(),
        selected.as_ref().map_or("default", |v| v.name.as_str())
    );

    let utterance = Utterance {
        id,
        text,
        voice: selected,
        lang: profile.lang.to_string(),
        pitch: profile.pitch,
        rate: profile.rate,
        volume: VOLUME,
    };

    let weak_state: Weak<Mutex<State>> = Arc::downgrade(state);
    platform.speak(
        utterance,
        Box::new(move |event| {
            if let Some(state) = weak_state.upgrade() {
                let mut state = lock(&state);
                if state.current == Some(id) {
                    state.current = None;
                }
            }
            match &event {
                UtteranceEvent::End => debug!("Utterance {id} finished"),
                UtteranceEvent::Interrupted => debug!("Utterance {id} interrupted"),
                UtteranceEvent::Error(e) => warn!("Utterance {id} failed: {e}"),
            }
            on_event(event);
        }),
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Mutex as StdMutex;

    #[derive(Debug, Clone, PartialEq)]
    enum Call {
        Speak(UtteranceId),
        Cancel,
        Pause,
        Resume,
    }

    /// Records calls; events are fired by the test. `cancel` interrupts the
    /// in-flight utterance synchronously, the way browsers do.
    #[derive(Default)]
    struct FakePlatform {
        available: AtomicBool,
        voices: StdMutex<Vec<PlatformVoice>>,
        voices_changed: StdMutex<Option<crate::speech::VoicesChangedCallback>>,
        calls: StdMutex<Vec<Call>>,
        spoken: StdMutex<Vec<Utterance>>,
        in_flight: StdMutex<Option<EventCallback>>,
        /// The next `voices()` call fails the load mid-query.
        fail_load_on_voices: AtomicBool,
    }

    impl FakePlatform {
        fn with_voices(voices: Vec<PlatformVoice>) -> Arc<Self> {
            Arc::new(Self {
                available: AtomicBool::new(true),
                voices: StdMutex::new(voices),
                ..Self::default()
            })
        }

        fn finish(&self, event: UtteranceEvent) {
            let cb = self.in_flight.lock().unwrap().take().expect("nothing in flight");
            cb(event);
        }

        fn load_voices(&self, voices: Vec<PlatformVoice>) {
            *self.voices.lock().unwrap() = voices;
            let cb = self.voices_changed.lock().unwrap().clone();
            if let Some(cb) = cb {
                cb();
            }
        }

        fn calls(&self) -> Vec<Call> {
            self.calls.lock().unwrap().clone()
        }

        fn last_spoken(&self) -> Utterance {
            self.spoken.lock().unwrap().last().cloned().expect("nothing spoken")
        }
    }

    impl SpeechPlatform for FakePlatform {
        fn is_available(&self) -> bool {
            self.available.load(Ordering::SeqCst)
        }

        fn voices(&self) -> Vec<PlatformVoice> {
            if self.fail_load_on_voices.swap(false, Ordering::SeqCst) {
                self.available.store(false, Ordering::SeqCst);
                let cb = self.voices_changed.lock().unwrap().clone();
                if let Some(cb) = cb {
                    cb();
                }
            }
            self.voices.lock().unwrap().clone()
        }

        fn set_voices_changed(&self, callback: Option<crate::speech::VoicesChangedCallback>) {
            *self.voices_changed.lock().unwrap() = callback;
        }

        fn speak(&self, utterance: Utterance, on_event: EventCallback) {
            self.calls.lock().unwrap().push(Call::Speak(utterance.id));
            self.spoken.lock().unwrap().push(utterance);
            *self.in_flight.lock().unwrap() = Some(on_event);
        }

        fn pause(&self) {
            self.calls.lock().unwrap().push(Call::Pause);
        }

        fn resume(&self) {
            self.calls.lock().unwrap().push(Call::Resume);
        }

        fn cancel(&self) {
            self.calls.lock().unwrap().push(Call::Cancel);
            let cb = self.in_flight.lock().unwrap().take();
            if let Some(cb) = cb {
                cb(UtteranceEvent::Interrupted);
            }
        }

        fn is_speaking(&self) -> bool {
            self.in_flight.lock().unwrap().is_some()
        }
    }

    fn voice(name: &str, lang: &str) -> PlatformVoice {
        PlatformVoice {
            name: name.into(),
            lang: lang.into(),
            default: false,
        }
    }

    fn english_voices() -> Vec<PlatformVoice> {
        vec![voice("af_heart", "en-US"), voice("bf_emma", "en-GB")]
    }

    #[test]
    fn speak_cleans_text_and_applies_profile() {
        let platform = FakePlatform::with_voices(english_voices());
        let controller = SpeechController::new(platform.clone());

        controller
            .speak("Relax.  [PAUSE 10s]\n Let go.", VoiceName::Gentle, None)
            .unwrap();

        let u = platform.last_spoken();
        assert_eq!(u.text, "Relax. ... Let go.");
        assert_eq!(u.voice.unwrap().name, "bf_emma");
        assert_eq!(u.lang, "en-GB");
        assert_eq!(u.pitch, 1.1);
        assert_eq!(u.rate, 0.8);
        assert_eq!(u.volume, 1.0);
    }

    #[test]
    fn unmatched_language_falls_back_to_first_voice() {
        let voices = english_voices();
        assert_eq!(select_voice(&voices, "en-AU").unwrap().name, "af_heart");
        assert_eq!(select_voice(&voices, "EN_gb").unwrap().name, "bf_emma");
        assert!(select_voice(&[], "en-US").is_none());
    }

    #[test]
    fn speak_while_speaking_cancels_first_and_swaps_reference_once() {
        let platform = FakePlatform::with_voices(english_voices());
        let controller = SpeechController::new(platform.clone());

        let first = controller.speak("one", VoiceName::Serene, None).unwrap();
        assert_eq!(controller.current_utterance(), Some(first));

        let second = controller.speak("two", VoiceName::Serene, None).unwrap();
        assert_ne!(first, second);
        // The first utterance's interruption must not clear the new reference.
        assert_eq!(controller.current_utterance(), Some(second));

        assert_eq!(
            platform.calls(),
            vec![
                Call::Cancel,
                Call::Speak(first),
                Call::Cancel,
                Call::Speak(second),
            ]
        );
    }

    #[test]
    fn on_end_runs_only_on_completion() {
        let platform = FakePlatform::with_voices(english_voices());
        let controller = SpeechController::new(platform.clone());
        let ended = Arc::new(AtomicUsize::new(0));

        let counter = ended.clone();
        controller
            .speak(
                "fail",
                VoiceName::Serene,
                Some(Box::new(move || {
                    counter.fetch_add(1, Ordering::SeqCst);
                })),
            )
            .unwrap();
        platform.finish(UtteranceEvent::Error("audio device lost".into()));
        assert_eq!(ended.load(Ordering::SeqCst), 0);
        assert_eq!(controller.current_utterance(), None);

        let counter = ended.clone();
        controller
            .speak(
                "ok",
                VoiceName::Serene,
                Some(Box::new(move || {
                    counter.fetch_add(1, Ordering::SeqCst);
                })),
            )
            .unwrap();
        platform.finish(UtteranceEvent::End);
        assert_eq!(ended.load(Ordering::SeqCst), 1);
        assert_eq!(controller.current_utterance(), None);
    }

    #[test]
    fn utterance_waits_for_voices() {
        let platform = FakePlatform::with_voices(Vec::new());
        let controller = SpeechController::new(platform.clone());

        let id = controller.speak("later", VoiceName::Serene, None).unwrap();
        assert_eq!(platform.calls(), vec![Call::Cancel]);

        // An empty notification does not start it.
        platform.load_voices(Vec::new());
        assert_eq!(platform.calls(), vec![Call::Cancel]);

        platform.load_voices(english_voices());
        assert_eq!(platform.calls(), vec![Call::Cancel, Call::Speak(id)]);
        assert_eq!(platform.last_spoken().voice.unwrap().name, "af_heart");
        assert_eq!(controller.current_utterance(), Some(id));
    }

    #[tokio::test]
    async fn parked_utterance_fails_if_platform_goes_away() {
        let platform = FakePlatform::with_voices(Vec::new());
        let controller = Arc::new(SpeechController::new(platform.clone()));

        let task = {
            let controller = controller.clone();
            tokio::spawn(async move { controller.speak_to_end("later", VoiceName::Serene).await })
        };
        while controller.current_utterance().is_none() {
            tokio::task::yield_now().await;
        }

        platform.available.store(false, Ordering::SeqCst);
        platform.load_voices(Vec::new());
        assert_eq!(
            task.await.unwrap(),
            Err(SpeechError::Playback("speech platform unavailable".into()))
        );
        assert_eq!(controller.current_utterance(), None);
    }

    #[tokio::test]
    async fn load_failure_before_parking_still_fails_the_utterance() {
        let platform = FakePlatform::with_voices(Vec::new());
        platform.fail_load_on_voices.store(true, Ordering::SeqCst);
        let controller = SpeechController::new(platform.clone());

        let result = tokio::time::timeout(
            std::time::Duration::from_secs(2),
            controller.speak_to_end("hi", VoiceName::Serene),
        )
        .await
        .expect("utterance left parked");
        assert_eq!(
            result,
            Err(SpeechError::Playback("speech platform unavailable".into()))
        );
        assert_eq!(controller.current_utterance(), None);
    }

    #[test]
    fn stop_clears_reference_and_parked_utterance() {
        let platform = FakePlatform::with_voices(Vec::new());
        let controller = SpeechController::new(platform.clone());

        controller.speak("never", VoiceName::Serene, None).unwrap();
        controller.stop();
        assert_eq!(controller.current_utterance(), None);

        platform.load_voices(english_voices());
        assert!(!platform.calls().iter().any(|c| matches!(c, Call::Speak(_))));
    }

    #[test]
    fn pause_and_resume_forward_to_platform() {
        let platform = FakePlatform::with_voices(english_voices());
        let controller = SpeechController::new(platform.clone());

        controller.speak("x", VoiceName::Bright, None).unwrap();
        assert!(controller.is_speaking());
        controller.pause();
        controller.resume();
        controller.stop();
        assert!(!controller.is_speaking());

        let calls = platform.calls();
        assert_eq!(&calls[2..], &[Call::Pause, Call::Resume, Call::Cancel]);
    }

    #[test]
    fn unavailable_platform_is_an_error() {
        let platform = Arc::new(FakePlatform::default());
        let controller = SpeechController::new(platform.clone());

        assert_eq!(
            controller.speak("x", VoiceName::Serene, None),
            Err(SpeechError::Unsupported)
        );
        assert!(platform.calls().is_empty());
    }

    #[tokio::test]
    async fn speak_to_end_reports_outcome() {
        let platform = FakePlatform::with_voices(english_voices());
        let controller = Arc::new(SpeechController::new(platform.clone()));

        let task = {
            let controller = controller.clone();
            tokio::spawn(async move { controller.speak_to_end("hello", VoiceName::Serene).await })
        };
        while !platform.is_speaking() {
            tokio::task::yield_now().await;
        }
        platform.finish(UtteranceEvent::Error("synthesis-failed".into()));
        assert_eq!(
            task.await.unwrap(),
            Err(SpeechError::Playback("synthesis-failed".into()))
        );

        let task = {
            let controller = controller.clone();
            tokio::spawn(async move { controller.speak_to_end("again", VoiceName::Serene).await })
        };
        while !platform.is_speaking() {
            tokio::task::yield_now().await;
        }
        controller.stop();
        assert_eq!(task.await.unwrap(), Err(SpeechError::Interrupted));
    }

    #[test]
    fn dropping_controller_unregisters_voices_callback() {
        let platform = FakePlatform::with_voices(Vec::new());
        let controller = SpeechController::new(platform.clone());
        assert!(platform.voices_changed.lock().unwrap().is_some());
        drop(controller);
        assert!(platform.voices_changed.lock().unwrap().is_none());
    }
}
