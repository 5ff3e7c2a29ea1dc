use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

/// Playback rate every remote stream is decoded at.
pub const PLAYOUT_SAMPLE_RATE: u32 = 48_000;
pub const PLAYOUT_CHANNELS: u32 = 1;

/// Per-participant queues of decoded remote audio, mixed on pull.
///
/// `NativeAudioStream` tasks push i16 samples under the participant's
/// uid. The platform audio callback pulls one mixed buffer. Each queue is
/// capped; the oldest samples are dropped when a consumer falls behind.
pub struct PlayoutMixer {
    streams: Mutex<HashMap<String, VecDeque<i16>>>,
    max_samples: usize,
}

impl PlayoutMixer {
    pub fn new() -> Self {
        // 2 seconds per stream
        Self::with_capacity(PLAYOUT_SAMPLE_RATE as usize * 2)
    }

    pub fn with_capacity(max_samples: usize) -> Self {
        Self {
            streams: Mutex::new(HashMap::new()),
            max_samples,
        }
    }

    pub fn push(&self, uid: &str, samples: &[i16]) {
        let mut streams = self.lock();
        let queue = streams.entry(uid.to_string()).or_default();
        queue.extend(samples.iter().copied());

        let overflow = queue.len().saturating_sub(self.max_samples);
        if overflow > 0 {
            queue.drain(..overflow);
        }
    }

    /// Fill `out` with the saturating sum of every stream.
    ///
    /// Returns the length of the longest contribution; the rest of `out`
    /// is silence.
    pub fn pull_mixed(&self, out: &mut [i16]) -> usize {
        out.fill(0);
        let mut written = 0;
        let mut streams = self.lock();
        for queue in streams.values_mut() {
            let available = queue.len().min(out.len());
            for (slot, sample) in out.iter_mut().zip(queue.drain(..available)) {
                *slot = slot.saturating_add(sample);
            }
            written = written.max(available);
        }
        written
    }

    pub fn remove(&self, uid: &str) {
        self.lock().remove(uid);
    }

    pub fn stream_count(&self) -> usize {
        self.lock().len()
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, VecDeque<i16>>> {
        self.streams.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Default for PlayoutMixer {
    fn default() -> Self {
        Self::new()
    }
}
