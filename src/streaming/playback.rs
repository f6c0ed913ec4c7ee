//! Playback clock
//!
//! Turns elapsed time into frame indices. Speed carries the direction (a
//! negative speed plays backwards). After play, stop or seek the clock holds
//! still in a buffering state until the streamer has the first frames ready.

use crate::streaming::catalog::VolumeCatalog;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PlayMode {
    Playing,
    Paused,
    Stopped,
}

/// Outcome of one [`PlaybackState::advance`] step
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameAdvance {
    pub previous: u32,
    pub current: u32,
    /// A frame boundary was crossed
    pub crossed: bool,
    /// Looping playback wrapped around
    pub wrapped: bool,
    /// Non-looping playback reached its end
    pub finished: bool,
}

/// Playback position of one sequence
#[derive(Debug, Clone)]
pub struct PlaybackState {
    frame_count: u32,
    frame_rate: f32,
    elapsed: f32,
    speed: f32,
    looping: bool,
    mode: PlayMode,
    start_offset: f32,
    loop_count: u32,
    generation: u64,
    buffering: bool,
}

impl PlaybackState {
    pub fn new(frame_count: u32, frame_rate: f32) -> Self {
        Self {
            frame_count,
            frame_rate,
            elapsed: 0.0,
            speed: 1.0,
            looping: false,
            mode: PlayMode::Stopped,
            start_offset: 0.0,
            loop_count: 0,
            generation: 0,
            buffering: true,
        }
    }

    pub fn for_catalog(catalog: &VolumeCatalog) -> Self {
        Self::new(catalog.frame_count(), catalog.frame_rate())
    }

    /// Length of one pass through the sequence in seconds
    pub fn period(&self) -> f32 {
        if self.frame_rate > 0.0 {
            self.frame_count as f32 / self.frame_rate
        } else {
            0.0
        }
    }

    fn frame_at(&self, seconds: f32) -> u32 {
        let last = self.frame_count.saturating_sub(1);
        // Tolerate float error from seek's frame -> seconds conversion
        ((seconds.max(0.0) * self.frame_rate + 1e-3).floor() as u32).min(last)
    }

    fn last_frame_time(&self) -> f32 {
        self.frame_count.saturating_sub(1) as f32 / self.frame_rate.max(f32::EPSILON)
    }

    // --- Transport ---

    pub fn play(&mut self) {
        if self.mode == PlayMode::Stopped {
            self.elapsed = self.start_offset;
            self.generation += 1;
            self.buffering = true;
        }
        self.mode = PlayMode::Playing;
    }

    pub fn pause(&mut self) {
        if self.mode == PlayMode::Playing {
            self.mode = PlayMode::Paused;
        }
    }

    /// Stop and rewind to the start offset
    pub fn stop(&mut self) {
        self.mode = PlayMode::Stopped;
        self.elapsed = self.start_offset;
        self.loop_count = 0;
        self.generation += 1;
        self.buffering = true;
    }

    /// Jump to a frame; starts a new request generation
    pub fn seek(&mut self, frame: u32) {
        let frame = frame.min(self.frame_count.saturating_sub(1));
        self.elapsed = frame as f32 / self.frame_rate.max(f32::EPSILON);
        self.generation += 1;
        self.buffering = true;
    }

    pub fn set_speed(&mut self, speed: f32) {
        self.speed = speed;
    }

    pub fn set_looping(&mut self, looping: bool) {
        self.looping = looping;
    }

    pub fn set_start_offset(&mut self, seconds: f32) {
        self.start_offset = seconds.clamp(0.0, self.last_frame_time());
    }

    /// Advance the clock by `dt` seconds of wall time
    pub fn advance(&mut self, dt: f32) -> FrameAdvance {
        let previous = self.current_frame();
        let mut step = FrameAdvance {
            previous,
            current: previous,
            crossed: false,
            wrapped: false,
            finished: false,
        };
        if self.mode != PlayMode::Playing || self.buffering || self.frame_count == 0 {
            return step;
        }

        let period = self.period();
        let mut elapsed = self.elapsed + dt * self.speed;

        if self.looping && period > 0.0 {
            if !(0.0..period).contains(&elapsed) {
                let wraps = (elapsed / period).floor().abs() as u32;
                elapsed = elapsed.rem_euclid(period);
                self.loop_count += wraps.max(1);
                step.wrapped = true;
            }
        } else {
            let end = self.last_frame_time();
            if elapsed >= end && self.speed > 0.0 {
                elapsed = end;
                step.finished = true;
            } else if elapsed <= 0.0 && self.speed < 0.0 {
                elapsed = 0.0;
                step.finished = true;
            }
        }

        self.elapsed = elapsed;
        step.current = self.current_frame();
        step.crossed = step.current != previous || step.wrapped;
        step
    }

    // --- Buffering gate ---

    pub fn is_buffering(&self) -> bool {
        self.buffering
    }

    /// Let the clock run; called once the first frames are available
    pub fn end_buffering(&mut self) {
        if self.buffering {
            log::debug!("Buffering done at frame {}", self.current_frame());
        }
        self.buffering = false;
    }

    // --- Queries ---

    pub fn current_frame(&self) -> u32 {
        self.frame_at(self.elapsed)
    }

    /// +1 forward, -1 backward
    pub fn direction(&self) -> i32 {
        if self.speed < 0.0 { -1 } else { 1 }
    }

    pub fn speed(&self) -> f32 {
        self.speed
    }

    pub fn elapsed(&self) -> f32 {
        self.elapsed
    }

    pub fn is_looping(&self) -> bool {
        self.looping
    }

    pub fn mode(&self) -> PlayMode {
        self.mode
    }

    pub fn loop_count(&self) -> u32 {
        self.loop_count
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn frame_count(&self) -> u32 {
        self.frame_count
    }

    pub fn frame_rate(&self) -> f32 {
        self.frame_rate
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn playing(frame_count: u32) -> PlaybackState {
        let mut playback = PlaybackState::new(frame_count, 10.0);
        playback.play();
        playback.end_buffering();
        playback
    }

    #[test]
    fn test_advance_crosses_frames() {
        let mut playback = playing(20);
        let step = playback.advance(0.05);
        assert!(!step.crossed);
        assert_eq!(step.current, 0);

        let step = playback.advance(0.06);
        assert!(step.crossed);
        assert_eq!(step.previous, 0);
        assert_eq!(step.current, 1);
    }

    #[test]
    fn test_buffering_holds_clock() {
        let mut playback = PlaybackState::new(20, 10.0);
        playback.play();
        assert!(playback.is_buffering());
        assert!(!playback.advance(1.0).crossed);
        assert_eq!(playback.current_frame(), 0);

        playback.end_buffering();
        assert_eq!(playback.advance(0.35).current, 3);
    }

    #[test]
    fn test_non_looping_clamps_at_end() {
        let mut playback = playing(5);
        let step = playback.advance(10.0);
        assert!(step.finished);
        assert_eq!(step.current, 4);
        assert_eq!(playback.loop_count(), 0);
    }

    #[test]
    fn test_looping_wraps() {
        let mut playback = playing(5);
        playback.set_looping(true);
        playback.advance(0.45);
        let step = playback.advance(0.1);
        assert!(step.wrapped);
        assert!(step.crossed);
        assert_eq!(step.current, 0);
        assert_eq!(playback.loop_count(), 1);
    }

    #[test]
    fn test_reverse_playback() {
        let mut playback = playing(10);
        playback.seek(5);
        playback.end_buffering();
        playback.set_speed(-1.0);
        assert_eq!(playback.direction(), -1);

        let step = playback.advance(0.15);
        assert_eq!(step.current, 3);

        playback.set_looping(true);
        let step = playback.advance(0.4);
        assert!(step.wrapped);
        assert_eq!(step.current, 9);
    }

    #[test]
    fn test_seek_bumps_generation() {
        let mut playback = playing(10);
        let generation = playback.generation();
        playback.seek(7);
        assert_eq!(playback.current_frame(), 7);
        assert!(playback.generation() > generation);
        assert!(playback.is_buffering());

        playback.seek(100);
        assert_eq!(playback.current_frame(), 9);
    }

    #[test]
    fn test_pause_and_stop() {
        let mut playback = playing(10);
        playback.set_start_offset(0.2);
        playback.advance(0.5);
        playback.pause();
        assert!(!playback.advance(0.5).crossed);
        assert_eq!(playback.mode(), PlayMode::Paused);

        playback.stop();
        assert_eq!(playback.current_frame(), 2);
        assert_eq!(playback.mode(), PlayMode::Stopped);
        playback.play();
        assert!(playback.is_buffering());
    }
}
