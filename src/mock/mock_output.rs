use util::sync::Mutex;

use crate::error::{Error, Result};
use crate::output::{AudioFrame, AudioOutput, DtmfEvent, VideoFrame, VideoOutput};
use crate::payload::{AudioCodec, VideoCodec};

#[derive(Debug)]
struct DeviceState<C, F> {
    started: bool,
    starts: u32,
    stops: u32,
    codecs: Vec<C>,
    frames: Vec<F>,
    reject_frames: bool,
    failing: bool,
}

impl<C, F> Default for DeviceState<C, F> {
    fn default() -> Self {
        DeviceState {
            started: false,
            starts: 0,
            stops: 0,
            codecs: vec![],
            frames: vec![],
            reject_frames: false,
            failing: false,
        }
    }
}

/// MockAudioOutput records what playback hands the audio device.
#[derive(Debug, Default)]
pub struct MockAudioOutput {
    state: Mutex<DeviceState<AudioCodec, AudioFrame>>,
    dtmf: Mutex<Vec<DtmfEvent>>,
}

impl MockAudioOutput {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn frames(&self) -> Vec<AudioFrame> {
        self.state.lock().frames.clone()
    }

    pub fn sequence_numbers(&self) -> Vec<u16> {
        self.state.lock().frames.iter().map(|f| f.sequence_number).collect()
    }

    pub fn codecs(&self) -> Vec<AudioCodec> {
        self.state.lock().codecs.clone()
    }

    pub fn is_started(&self) -> bool {
        self.state.lock().started
    }

    /// start_stop_counts returns how often the device was started and stopped.
    pub fn start_stop_counts(&self) -> (u32, u32) {
        let state = self.state.lock();
        (state.starts, state.stops)
    }

    pub fn set_reject_frames(&self, reject: bool) {
        self.state.lock().reject_frames = reject;
    }

    /// set_failing makes start and codec_set fail as an unplugged device would.
    pub fn set_failing(&self, failing: bool) {
        self.state.lock().failing = failing;
    }

    pub fn dtmf_events(&self) -> Vec<DtmfEvent> {
        self.dtmf.lock().clone()
    }
}

impl AudioOutput for MockAudioOutput {
    fn start(&self) -> Result<()> {
        let mut state = self.state.lock();
        if state.failing {
            return Err(Error::Other("device unavailable".to_owned()));
        }
        state.started = true;
        state.starts += 1;
        Ok(())
    }

    fn stop(&self) -> Result<()> {
        let mut state = self.state.lock();
        state.started = false;
        state.stops += 1;
        Ok(())
    }

    fn codec_set(&self, codec: AudioCodec) -> Result<()> {
        let mut state = self.state.lock();
        if state.failing {
            return Err(Error::Other("device unavailable".to_owned()));
        }
        state.codecs.push(codec);
        Ok(())
    }

    fn packet_put(&self, frame: &AudioFrame) -> Result<()> {
        let mut state = self.state.lock();
        if state.reject_frames {
            return Err(Error::ErrDevicePacketPut);
        }
        state.frames.push(frame.clone());
        Ok(())
    }

    fn dtmf_received(&self, event: DtmfEvent) {
        self.dtmf.lock().push(event);
    }
}

/// MockVideoOutput records what playback hands the decoder.
#[derive(Debug, Default)]
pub struct MockVideoOutput {
    state: Mutex<DeviceState<VideoCodec, VideoFrame>>,
    view: Mutex<(bool, bool)>,
}

impl MockVideoOutput {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn frames(&self) -> Vec<VideoFrame> {
        self.state.lock().frames.clone()
    }

    pub fn codecs(&self) -> Vec<VideoCodec> {
        self.state.lock().codecs.clone()
    }

    pub fn is_started(&self) -> bool {
        self.state.lock().started
    }

    pub fn start_stop_counts(&self) -> (u32, u32) {
        let state = self.state.lock();
        (state.starts, state.stops)
    }

    /// view_state returns the (hold, privacy) indications last set.
    pub fn view_state(&self) -> (bool, bool) {
        *self.view.lock()
    }

    pub fn set_reject_frames(&self, reject: bool) {
        self.state.lock().reject_frames = reject;
    }

    /// set_failing makes start and codec_set fail as an unplugged device would.
    pub fn set_failing(&self, failing: bool) {
        self.state.lock().failing = failing;
    }
}

impl VideoOutput for MockVideoOutput {
    fn start(&self) -> Result<()> {
        let mut state = self.state.lock();
        if state.failing {
            return Err(Error::Other("device unavailable".to_owned()));
        }
        state.started = true;
        state.starts += 1;
        Ok(())
    }

    fn stop(&self) -> Result<()> {
        let mut state = self.state.lock();
        state.started = false;
        state.stops += 1;
        Ok(())
    }

    fn codec_set(&self, codec: VideoCodec) -> Result<()> {
        let mut state = self.state.lock();
        if state.failing {
            return Err(Error::Other("device unavailable".to_owned()));
        }
        state.codecs.push(codec);
        Ok(())
    }

    fn frame_put(&self, frame: VideoFrame) -> Result<()> {
        let mut state = self.state.lock();
        if state.reject_frames {
            return Err(Error::ErrDevicePacketPut);
        }
        state.frames.push(frame);
        Ok(())
    }

    fn remote_view_hold_set(&self, held: bool) {
        self.view.lock().0 = held;
    }

    fn remote_view_privacy_set(&self, privacy: bool) {
        self.view.lock().1 = privacy;
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_mock_outputs_start_empty() {
        let audio = MockAudioOutput::default();
        assert!(audio.frames().is_empty());
        assert_eq!(audio.start_stop_counts(), (0, 0));
        assert!(!audio.is_started());

        let video = MockVideoOutput::default();
        assert!(video.frames().is_empty());
        assert!(video.codecs().is_empty());
        assert_eq!(video.view_state(), (false, false));
    }
}
