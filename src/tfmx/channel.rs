//! Runtime blocks: the master block, the pattern block with its eight track
//! cursors, the sixteen voice controllers and the eight hardware voices.
//!
//! Controllers and hardware voices live in fixed arrays and refer to each
//! other by index.
use super::flags::{LoopMode, VoiceMode};
use super::DEFAULT_E_CLOCKS;

/// Number of hardware voices and of track cursors.
pub(crate) const VOICES: usize = 8;
/// Number of controller slots. Only the first four or eight are driven,
/// depending on the voice mode.
pub(crate) const CONTROLLER_SLOTS: usize = 16;

/// Global playback state shared by every voice.
#[derive(Debug, Clone)]
pub(crate) struct Master {
    pub(crate) enabled: bool,
    pub(crate) current_song: usize,
    pub(crate) speed_count: i32,
    /// Tempo register, in 357 955 Hz clocks per tick ("CIA save").
    pub(crate) e_clocks: u32,
    pub(crate) master_vol: i32,
    pub(crate) fade_dest: i32,
    pub(crate) fade_time: i32,
    pub(crate) fade_reset: i32,
    pub(crate) fade_slope: i32,
    pub(crate) track_loop: i32,
    pub(crate) multimode: bool,
    pub(crate) play_patt_flag: bool,
}

impl Default for Master {
    fn default() -> Master {
        Master {
            enabled: false,
            current_song: 0,
            speed_count: 0,
            e_clocks: DEFAULT_E_CLOCKS,
            master_vol: 0x40,
            fade_dest: 0,
            fade_time: 0,
            fade_reset: 0,
            fade_slope: 0,
            track_loop: -1,
            multimode: false,
            play_patt_flag: false,
        }
    }
}

/// One track's position inside a pattern.
#[derive(Debug, Clone, Copy)]
pub(crate) struct PatternCursor {
    /// Word index of the pattern data, 0 when unassigned.
    pub(crate) addr: u32,
    /// Pattern number; `0xFF` idle, `0xFE` silence request, `0x80..` hold.
    pub(crate) num: u8,
    pub(crate) xpose: i8,
    /// `0xFFFF` when no loop is in progress.
    pub(crate) loops: u16,
    pub(crate) step: u32,
    pub(crate) wait: u8,
    pub(crate) ret_addr: u32,
    pub(crate) ret_step: u32,
}

impl Default for PatternCursor {
    fn default() -> PatternCursor {
        PatternCursor {
            addr: 0,
            num: 0xFF,
            xpose: 0,
            loops: 0xFFFF,
            step: 0,
            wait: 0,
            ret_addr: 0,
            ret_step: 0,
        }
    }
}

/// The trackstep position and the per-track pattern cursors.
#[derive(Debug, Clone, Default)]
pub(crate) struct PatternBlock {
    pub(crate) first_pos: u16,
    pub(crate) last_pos: u16,
    pub(crate) current_pos: u16,
    /// Tick divisor for the pattern pass.
    pub(crate) prescale: u16,
    pub(crate) cursors: [PatternCursor; VOICES],
}

/// Per-voice interpreter state: the running macro, the note and period
/// registers, the effect timers and the SFX lock.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Controller {
    /// Index of the hardware voice this controller drives.
    pub(crate) hw: usize,
    pub(crate) macro_ptr: u32,
    pub(crate) macro_step: u32,
    pub(crate) macro_wait: u16,
    pub(crate) macro_num: u8,
    pub(crate) macro_run: bool,
    /// `0xFF` for macros that yield after note-setting opcodes, 0 otherwise.
    pub(crate) new_style: u8,
    /// Negative: effects disarmed; zero: armed, runs from the next tick.
    pub(crate) efx_run: i32,
    pub(crate) prev_note: u8,
    pub(crate) curr_note: u8,
    pub(crate) velocity: u8,
    pub(crate) finetune: i8,
    /// True while the key is held; the key-up command clears it.
    pub(crate) key_up: bool,
    pub(crate) really_wait: u8,
    /// `-1` when no macro loop is in progress.
    pub(crate) loop_count: i32,
    pub(crate) wait_dma_count: u16,
    /// Sample region cursors, in bytes (addresses) and 16-bit words (lengths).
    pub(crate) cur_addr: u32,
    pub(crate) save_addr: u32,
    pub(crate) cur_len: u16,
    pub(crate) save_len: u16,
    pub(crate) cur_vol: i32,
    pub(crate) cur_period: u16,
    pub(crate) dest_period: u16,
    pub(crate) porta_per: i32,
    pub(crate) porta_rate: i32,
    pub(crate) porta_time: u8,
    pub(crate) porta_reset: u8,
    pub(crate) vib_width: i8,
    pub(crate) vib_offset: i16,
    pub(crate) vib_time: u8,
    pub(crate) vib_reset: u8,
    pub(crate) env_rate: u8,
    pub(crate) env_time: u8,
    pub(crate) env_reset: u8,
    pub(crate) env_end_vol: i8,
    pub(crate) add_begin: i32,
    pub(crate) add_begin_time: u16,
    pub(crate) add_begin_reset: u16,
    pub(crate) ret_ptr: u32,
    pub(crate) ret_step: u32,
    pub(crate) sfx_flag: u8,
    pub(crate) sfx_priority: u8,
    pub(crate) sfx_lock_time: i32,
    /// A pending note command parked by an external trigger.
    pub(crate) sfx_code: u32,
}

impl Default for Controller {
    fn default() -> Controller {
        Controller {
            hw: 0,
            macro_ptr: 0,
            macro_step: 0,
            macro_wait: 0,
            macro_num: 0,
            macro_run: false,
            new_style: 0xFF,
            efx_run: -1,
            prev_note: 0,
            curr_note: 0,
            velocity: 0,
            finetune: 0,
            key_up: false,
            really_wait: 0,
            loop_count: -1,
            wait_dma_count: 0,
            cur_addr: 0,
            save_addr: 0,
            cur_len: 0,
            save_len: 0,
            cur_vol: 0,
            cur_period: 0,
            dest_period: 0,
            porta_per: 0,
            porta_rate: 0,
            porta_time: 0,
            porta_reset: 0,
            vib_width: 0,
            vib_offset: 0,
            vib_time: 0,
            vib_reset: 0,
            env_rate: 0,
            env_time: 0,
            env_reset: 0,
            env_end_vol: 0,
            add_begin: 0,
            add_begin_time: 0,
            add_begin_reset: 0,
            ret_ptr: 0,
            ret_step: 0,
            sfx_flag: 0,
            sfx_priority: 0,
            sfx_lock_time: -1,
            sfx_code: 0,
        }
    }
}

impl Controller {
    /// Returns the controller to its idle state, keeping the voice binding.
    pub(crate) fn reset(&mut self) {
        let hw = self.hw;
        *self = Controller::default();
        self.hw = hw;
    }
}

/// One resampler slot: phase, phase increment, sample region and volume.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct Voice {
    /// Phase in 14-bit fractional fixed point.
    pub(crate) pos: u32,
    pub(crate) delta: u32,
    /// Current byte length; `slen << 14` is the fixed-point region end.
    pub(crate) slen: u32,
    pub(crate) sample_len: u32,
    /// Current byte offset into the sample bank.
    pub(crate) sbeg: u32,
    pub(crate) sample_start: u32,
    pub(crate) vol: i32,
    pub(crate) mode: VoiceMode,
    pub(crate) looper: LoopMode,
    /// Index of the owning controller.
    pub(crate) owner: usize,
}

impl Voice {
    /// Returns the voice to silence, keeping the controller binding.
    pub(crate) fn reset(&mut self) {
        let owner = self.owner;
        *self = Voice::default();
        self.owner = owner;
    }
}
