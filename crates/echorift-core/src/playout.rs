use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

/// Thread-safe mixing buffer for decoded remote audio PCM samples.
///
/// Per-track playout tasks push i16 samples tagged with the publishing
/// participant's identity; platform audio output pulls the mixed stream.
/// Each participant has a playout gain — deafen sets every gain to zero,
/// and participants unknown at push time get the current default gain, so
/// late joiners inherit the deafened state.
///
/// Max capacity prevents unbounded growth if the consumer is slower than
/// the producer; old samples are discarded.
pub struct PlayoutMixer {
    inner: Mutex<MixerState>,
    /// Maximum number of i16 samples to store (2 seconds at 48kHz mono).
    max_samples: usize,
}

struct MixerState {
    buffer: VecDeque<i16>,
    gains: HashMap<String, f32>,
    default_gain: f32,
}

impl PlayoutMixer {
    pub fn new() -> Self {
        let max_samples = 48_000 * 2;
        Self {
            inner: Mutex::new(MixerState {
                buffer: VecDeque::with_capacity(max_samples),
                gains: HashMap::new(),
                default_gain: 1.0,
            }),
            max_samples,
        }
    }

    /// Push PCM samples published by `identity`, applying their gain.
    ///
    /// If the buffer would exceed max capacity, oldest samples are dropped.
    pub fn push_samples(&self, identity: &str, samples: &[i16]) {
        let mut state = self.inner.lock().unwrap();
        let gain = state
            .gains
            .get(identity)
            .copied()
            .unwrap_or(state.default_gain);

        if gain == 0.0 {
            return;
        }
        if gain == 1.0 {
            state.buffer.extend(samples.iter().copied());
        } else {
            state
                .buffer
                .extend(samples.iter().map(|s| (*s as f32 * gain) as i16));
        }

        let overflow = state.buffer.len().saturating_sub(self.max_samples);
        if overflow > 0 {
            state.buffer.drain(..overflow);
        }
    }

    /// Pull up to `out.len()` samples. Returns the number actually written;
    /// unfilled positions are zeroed (silence).
    pub fn pull_samples(&self, out: &mut [i16]) -> usize {
        let mut state = self.inner.lock().unwrap();
        let available = state.buffer.len().min(out.len());

        for (i, sample) in state.buffer.drain(..available).enumerate() {
            out[i] = sample;
        }
        for sample in out[available..].iter_mut() {
            *sample = 0;
        }
        available
    }

    /// Set the playout gain for one participant.
    pub fn set_gain(&self, identity: &str, gain: f32) {
        self.inner
            .lock()
            .unwrap()
            .gains
            .insert(identity.to_string(), gain.clamp(0.0, 1.0));
    }

    /// Set the gain applied to participants with no explicit gain yet.
    /// Deafen sets this to 0 so tracks arriving later start silenced.
    pub fn set_default_gain(&self, gain: f32) {
        self.inner.lock().unwrap().default_gain = gain.clamp(0.0, 1.0);
    }

    pub fn gain(&self, identity: &str) -> f32 {
        let state = self.inner.lock().unwrap();
        state.gains.get(identity).copied().unwrap_or(state.default_gain)
    }

    /// Drop buffered samples and per-participant gains (on disconnect).
    pub fn clear(&self) {
        let mut state = self.inner.lock().unwrap();
        state.buffer.clear();
        state.gains.clear();
        state.default_gain = 1.0;
    }
}

impl Default for PlayoutMixer {
    fn default() -> Self {
        Self::new()
    }
}
