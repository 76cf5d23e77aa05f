//! `TfmxPlayer` related flags.
use bitflags::bitflags;

bitflags! {
    /// Hardware-voice mode bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct VoiceMode: u8 {
        /// The voice participates in mixing.
        const ENABLED  = 0b0000_0001;
        /// The mixer has latched the sample region since the voice was armed.
        const STARTED  = 0b0000_0010;
        /// Let the current sample pass run out, then shut the voice down.
        const ONE_SHOT = 0b0000_0100;
    }
}

bitflags! {
    /// Playback compatibility and output toggles.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct PlayerQuirks: u8 {
        /// Volume fixup on DMA-off, required by a handful of GemX modules.
        const GEMX              = 0b0000_0001;
        /// Zero the finetune on note load and restart samples on DMA-on.
        const DANGER_FREAK_HACK = 0b0000_0010;
        /// Linear interpolation while resampling.
        const OVERSAMPLING      = 0b0000_0100;
        /// Stereo cross-blend on the mixed output.
        const BLEND             = 0b0000_1000;
    }
}

/// What the mixer does when a voice's sample region wraps around.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LoopMode {
    /// Keep looping the saved sample region.
    #[default]
    Off,
    /// Count down the owning controller's DMA wait and wake its macro on zero.
    WaitDma,
}
