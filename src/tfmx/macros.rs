//! The macro interpreter: each controller runs a micro-program of 32-bit
//! instructions that shapes one voice, and `note_port` is the single entry
//! point through which patterns (and external triggers) reach it.
//!
//! Instruction layout: byte 0 opcode, byte 1 parameter A, byte 2 parameter
//! B, byte 3 parameter C; the low halfword doubles as a 16-bit operand.
use log::{trace, warn};

use super::channel::VOICES;
use super::flags::{LoopMode, PlayerQuirks, VoiceMode};
use super::mixer::DEFAULT_SAMPLE_LEN;
use super::player::PlayerState;
use super::{TfmxModule, NOTEVALS};

/// Instruction budget for one controller's macro pass within a tick.
const MACRO_FUSE: usize = 1024;

impl PlayerState {
    /// One controller's share of the tick: SFX-lock bookkeeping, a pending
    /// external trigger, the macro pass, the effects pass and the hardware
    /// voice update.
    pub(crate) fn do_macro(&mut self, module: &TfmxModule, cc: usize) {
        {
            let c = &mut self.cdb[cc];
            if c.sfx_lock_time >= 0 {
                c.sfx_lock_time -= 1;
            } else {
                c.sfx_flag = 0;
                c.sfx_priority = 0;
            }
        }
        let pending = self.cdb[cc].sfx_code;
        if pending != 0 {
            let c = &mut self.cdb[cc];
            c.sfx_flag = 0;
            c.sfx_code = 0;
            let priority = c.sfx_priority;
            trace!("deferred note command {:08x} on voice {}", pending, cc);
            self.note_port(module, pending);
            self.cdb[cc].sfx_flag = priority;
        }
        let run = {
            let c = &mut self.cdb[cc];
            if c.macro_run && c.macro_wait > 0 {
                c.macro_wait -= 1;
            }
            c.macro_run && c.macro_wait == 0
        };
        if run {
            self.run_macro(module, cc);
        }
        self.do_effects(cc);
        self.update_voice(cc);
    }

    /// Fetch-decode-execute until an opcode yields the tick.
    fn run_macro(&mut self, module: &TfmxModule, cc: usize) {
        for _ in 0..MACRO_FUSE {
            let (ptr, step) = {
                let c = &self.cdb[cc];
                (c.macro_ptr, c.macro_step)
            };
            let Some(&raw) = module.words.get(ptr.wrapping_add(step) as usize) else {
                warn!("macro ran out of module data on voice {}", cc);
                self.cdb[cc].macro_run = false;
                return;
            };
            let word = raw as u32;
            self.cdb[cc].macro_step = step.wrapping_add(1);
            let op = (word >> 24) as u8;
            let param_a = ((word >> 16) & 0xFF) as u8;
            let byte2 = ((word >> 8) & 0xFF) as u8;
            let byte3 = (word & 0xFF) as u8;
            let halfword = (word & 0xFFFF) as u16;

            match op {
                0x00 => {
                    // DMA off with the effect state cleared first
                    self.reset_effects(cc);
                    if self.dma_off(cc, param_a) {
                        return;
                    }
                }
                0x13 => {
                    if self.dma_off(cc, param_a) {
                        return;
                    }
                }
                0x01 => {
                    // DMA on: arm the voice on the saved sample region
                    let hw_index = self.cdb[cc].hw;
                    let restart = self.quirks.contains(PlayerQuirks::DANGER_FREAK_HACK);
                    let c = &mut self.cdb[cc];
                    c.efx_run = i32::from(param_a as i8);
                    let hw = &mut self.hdb[hw_index];
                    hw.mode = VoiceMode::ENABLED;
                    hw.sample_start = c.save_addr;
                    hw.sample_len = if c.save_len != 0 {
                        u32::from(c.save_len) << 1
                    } else {
                        DEFAULT_SAMPLE_LEN
                    };
                    if restart {
                        hw.sbeg = hw.sample_start;
                        hw.slen = hw.sample_len;
                        hw.pos = 0;
                        hw.mode |= VoiceMode::STARTED;
                    }
                }
                0x02 => {
                    let c = &mut self.cdb[cc];
                    c.save_addr = word & 0x00FF_FFFF;
                    c.cur_addr = c.save_addr;
                }
                0x11 => {
                    // sample-address vibrato
                    let c = &mut self.cdb[cc];
                    c.add_begin_time = u16::from(param_a);
                    c.add_begin_reset = u16::from(param_a);
                    c.add_begin = i32::from(halfword as i16);
                    c.cur_addr = c.cur_addr.wrapping_add_signed(c.add_begin);
                    c.save_addr = c.cur_addr;
                }
                0x03 => {
                    let c = &mut self.cdb[cc];
                    c.save_len = halfword;
                    c.cur_len = halfword;
                }
                0x12 => {
                    let c = &mut self.cdb[cc];
                    c.cur_len = c.cur_len.wrapping_add(halfword);
                    c.save_len = c.cur_len;
                }
                0x04 => {
                    if param_a & 1 != 0 {
                        let c = &mut self.cdb[cc];
                        let prior = c.really_wait;
                        c.really_wait = prior.wrapping_add(1);
                        if prior != 0 {
                            return;
                        }
                    }
                    self.cdb[cc].macro_wait = halfword;
                    if self.cdb[cc].new_style != 0 {
                        return;
                    }
                }
                0x1A => {
                    // stop until the sample region has wrapped
                    let hw_index = self.cdb[cc].hw;
                    self.hdb[hw_index].looper = LoopMode::WaitDma;
                    let c = &mut self.cdb[cc];
                    c.wait_dma_count = halfword;
                    c.macro_run = false;
                    if c.new_style != 0 {
                        return;
                    }
                }
                0x1C => {
                    if self.cdb[cc].curr_note > param_a {
                        self.cdb[cc].macro_step = u32::from(halfword);
                    }
                }
                0x1D => {
                    if self.cdb[cc].cur_vol > i32::from(param_a) {
                        self.cdb[cc].macro_step = u32::from(halfword);
                    }
                }
                0x10 => {
                    // loop only while the key is held
                    if self.cdb[cc].key_up {
                        self.macro_loop(cc, param_a, halfword);
                    }
                }
                0x05 => {
                    self.macro_loop(cc, param_a, halfword);
                }
                0x07 => {
                    self.cdb[cc].macro_run = false;
                    return;
                }
                0x0D => {
                    if byte2 != 0xFE {
                        let c = &mut self.cdb[cc];
                        c.cur_vol = (i32::from(c.velocity) * 3 + i32::from(byte3 as i8))
                            .clamp(0, 0x40);
                    }
                }
                0x0E => {
                    if byte2 != 0xFE {
                        self.cdb[cc].cur_vol = i32::from(byte3).min(0x40);
                    }
                }
                0x08 => {
                    let note = self.cdb[cc].curr_note.wrapping_add(param_a);
                    self.set_note_period(cc, note, byte3 as i8);
                    if self.cdb[cc].new_style != 0 {
                        return;
                    }
                }
                0x09 => {
                    self.set_note_period(cc, param_a, byte3 as i8);
                    if self.cdb[cc].new_style != 0 {
                        return;
                    }
                }
                0x1F => {
                    let note = self.cdb[cc].prev_note.wrapping_add(param_a);
                    self.set_note_period(cc, note, byte3 as i8);
                    if self.cdb[cc].new_style != 0 {
                        return;
                    }
                }
                0x17 => {
                    let c = &mut self.cdb[cc];
                    c.dest_period = halfword;
                    if c.porta_rate == 0 {
                        c.cur_period = halfword;
                    }
                }
                0x0B => {
                    let c = &mut self.cdb[cc];
                    c.porta_reset = param_a;
                    c.porta_time = 1;
                    if c.porta_rate == 0 {
                        c.porta_per = i32::from(c.dest_period);
                    }
                    c.porta_rate = i32::from(halfword as i16);
                }
                0x0C => {
                    let c = &mut self.cdb[cc];
                    c.vib_reset = param_a;
                    c.vib_time = param_a >> 1;
                    c.vib_width = byte3 as i8;
                    c.vib_offset = 0;
                }
                0x0F => {
                    let c = &mut self.cdb[cc];
                    c.env_rate = param_a;
                    c.env_reset = byte2;
                    c.env_time = byte2;
                    c.env_end_vol = byte3 as i8;
                }
                0x0A => {
                    self.reset_effects(cc);
                }
                0x14 => {
                    // hold here until key-up, with an optional timeout
                    let c = &mut self.cdb[cc];
                    if !c.key_up {
                        continue;
                    }
                    if c.loop_count == 0 {
                        c.loop_count = -1;
                        continue;
                    }
                    if c.loop_count == -1 {
                        c.loop_count = i32::from(byte3) - 1;
                    } else {
                        c.loop_count -= 1;
                    }
                    c.macro_step = c.macro_step.wrapping_sub(1);
                    return;
                }
                0x15 => {
                    // call: save the return frame, then continue elsewhere
                    let c = &mut self.cdb[cc];
                    c.ret_ptr = c.macro_ptr;
                    c.ret_step = c.macro_step;
                    c.macro_ptr = module.macro_index(param_a);
                    c.macro_step = u32::from(halfword);
                    c.loop_count = -1;
                }
                0x06 => {
                    let c = &mut self.cdb[cc];
                    c.macro_ptr = module.macro_index(param_a);
                    c.macro_step = u32::from(halfword);
                    c.loop_count = -1;
                }
                0x16 => {
                    let c = &mut self.cdb[cc];
                    c.macro_ptr = c.ret_ptr;
                    c.macro_step = c.ret_step;
                }
                0x18 => {
                    // move the loop start forward inside the sample
                    let offset = u32::from(halfword & 0xFFFE);
                    let c = &mut self.cdb[cc];
                    c.save_addr = c.save_addr.wrapping_add(offset);
                    c.save_len = c.save_len.wrapping_sub((offset >> 1) as u16);
                }
                0x19 => {
                    let c = &mut self.cdb[cc];
                    c.save_addr = 0;
                    c.cur_addr = 0;
                    c.save_len = 1;
                }
                0x20 => {
                    self.signal[(param_a & 3) as usize] = halfword;
                }
                0x21 => {
                    // replay the current note through another voice
                    let command = {
                        let c = &self.cdb[cc];
                        (u32::from(c.curr_note) << 24)
                            | (u32::from(param_a) << 16)
                            | (u32::from((c.velocity << 4) | (byte2 & 0x0F)) << 8)
                            | u32::from(byte3)
                    };
                    self.note_port(module, command);
                }
                // 0x1B (random) and 0x1E (add volume + note) are inert
                _ => {}
            }
        }
        warn!("macro runaway on voice {}, stopping it", cc);
        self.cdb[cc].macro_run = false;
    }

    /// DMA off. Returns true when the macro pass must yield the tick.
    fn dma_off(&mut self, cc: usize, param_a: u8) -> bool {
        let hw_index = self.cdb[cc].hw;
        let gemx = self.quirks.contains(PlayerQuirks::GEMX);
        let c = &mut self.cdb[cc];
        let hw = &mut self.hdb[hw_index];
        hw.looper = LoopMode::Off;
        if param_a == 0 {
            hw.mode = VoiceMode::empty();
            if c.new_style != 0 {
                hw.slen = 0;
            }
            if gemx {
                hw.vol = 0;
                c.cur_vol = 0;
            }
            false
        } else {
            hw.mode |= VoiceMode::ONE_SHOT;
            c.new_style = 0;
            true
        }
    }

    /// The shared loop step: prior-zero releases, prior-negative loads the
    /// iteration count, anything else decrements; both load and decrement
    /// take the jump.
    fn macro_loop(&mut self, cc: usize, param_a: u8, halfword: u16) {
        let c = &mut self.cdb[cc];
        let prior = c.loop_count;
        c.loop_count = prior.wrapping_sub(1);
        if prior == 0 {
            return;
        }
        if prior < 0 {
            c.loop_count = i32::from(param_a) - 1;
        }
        c.macro_step = u32::from(halfword);
    }

    fn set_note_period(&mut self, cc: usize, note: u8, detune: i8) {
        let c = &mut self.cdb[cc];
        let period = i32::from(NOTEVALS[(note & 0x3F) as usize]);
        let scale = 256 + i32::from(c.finetune) + i32::from(detune);
        let dest = ((period * scale) >> 8).clamp(0, 0xFFF) as u16;
        c.dest_period = dest;
        if c.porta_rate == 0 {
            c.cur_period = dest;
        }
    }

    pub(crate) fn reset_effects(&mut self, cc: usize) {
        let c = &mut self.cdb[cc];
        c.env_reset = 0;
        c.vib_reset = 0;
        c.vib_offset = 0;
        c.porta_rate = 0;
        c.add_begin = 0;
        c.add_begin_time = 0;
        c.add_begin_reset = 0;
    }

    /// Routes a 32-bit note command to its controller: notes arm a macro,
    /// portamento notes re-target the slide, and the `0xF5`/`0xF6`/`0xF7`
    /// commands load key-up, vibrato and envelope parameters directly.
    pub(crate) fn note_port(&mut self, module: &TfmxModule, command: u32) {
        let byte0 = (command >> 24) as u8;
        let byte1 = ((command >> 16) & 0xFF) as u8;
        let byte2 = ((command >> 8) & 0xFF) as u8;
        let byte3 = (command & 0xFF) as u8;
        let mask = if self.mdb.multimode { 7 } else { 3 };
        let cc = usize::from(byte2 & mask);

        if byte0 == 0xFC {
            // sound-effect lock
            let c = &mut self.cdb[cc];
            c.sfx_flag = byte1;
            c.sfx_priority = byte2 >> 4;
            c.sfx_lock_time = i32::from(byte3);
            return;
        }
        if self.cdb[cc].sfx_flag != 0 {
            return;
        }

        if byte0 < 0xC0 {
            let finetune = if self.quirks.contains(PlayerQuirks::DANGER_FREAK_HACK) {
                0
            } else {
                byte3 as i8
            };
            let c = &mut self.cdb[cc];
            c.finetune = finetune;
            c.velocity = (byte2 >> 4) & 0x0F;
            c.prev_note = c.curr_note;
            c.curr_note = byte0 & 0x3F;
            c.really_wait = 1;
            c.new_style = 0xFF;
            c.macro_num = byte1;
            c.macro_ptr = module.macro_index(byte1);
            c.macro_step = 0;
            c.macro_wait = 0;
            c.key_up = true;
            c.loop_count = -1;
            c.efx_run = -1;
            c.macro_run = true;
            trace!(
                "note {:02x} macro {:02x} velocity {} on voice {}",
                c.curr_note,
                c.macro_num,
                c.velocity,
                cc
            );
        } else if byte0 < 0xF0 {
            // portamento towards the new note
            let c = &mut self.cdb[cc];
            c.porta_reset = byte1;
            c.porta_time = 1;
            if c.porta_rate == 0 {
                c.porta_per = i32::from(c.dest_period);
            }
            c.porta_rate = i32::from(byte3 as i8);
            c.curr_note = byte0 & 0x3F;
            c.dest_period = NOTEVALS[usize::from(c.curr_note)];
        } else {
            match byte0 & 0x0F {
                0x5 => self.cdb[cc].key_up = false,
                0x6 => {
                    let c = &mut self.cdb[cc];
                    c.vib_reset = byte1;
                    c.vib_time = byte1 >> 1;
                    c.vib_width = byte3 as i8;
                    c.vib_offset = 0;
                }
                0x7 => {
                    let c = &mut self.cdb[cc];
                    c.env_rate = byte1;
                    c.env_reset = byte2;
                    c.env_time = byte2;
                    c.env_end_vol = byte3 as i8;
                }
                _ => {}
            }
        }
    }

    /// Silences one voice unless its controller is SFX-locked.
    pub(crate) fn channel_off(&mut self, voice: usize) {
        let cc = voice & (VOICES - 1);
        if self.cdb[cc].sfx_flag != 0 {
            return;
        }
        let hw_index = self.cdb[cc].hw;
        let c = &mut self.cdb[cc];
        c.add_begin_time = 0;
        c.add_begin_reset = 0;
        c.macro_run = false;
        c.efx_run = -1;
        c.cur_vol = 0;
        let hw = &mut self.hdb[hw_index];
        hw.mode = VoiceMode::empty();
        hw.vol = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::super::player::tests::{build_module, two_position_module};
    use super::super::player::PlayerState;
    use super::super::flags::VoiceMode;

    fn idle_line() -> [u16; 8] {
        let idle = 0xFF00u16;
        [0x0000, idle, idle, idle, idle, idle, idle, idle]
    }

    /// Builds a module whose single pattern plays note 24 through the given
    /// macro body.
    fn macro_module(body: &[u32]) -> super::super::TfmxModule {
        build_module(
            &[idle_line()],
            &[&[0x9800_F000, 0xF400_0000]],
            &[body],
            125,
            (0..64).map(|n| n as u8).collect(),
        )
    }

    fn armed_state(module: &super::super::TfmxModule) -> PlayerState {
        let mut state = PlayerState::new(44100);
        state.start_song(module, 0, false);
        state.tick(module); // pattern pass arms the macro
        state
    }

    #[test]
    fn loop_counter_prior_value_branches() {
        let mut state = PlayerState::new(44100);
        // negative prior: loads the count and jumps
        state.cdb[0].loop_count = -1;
        state.cdb[0].macro_step = 9;
        state.macro_loop(0, 3, 4);
        assert_eq!(state.cdb[0].loop_count, 2);
        assert_eq!(state.cdb[0].macro_step, 4);
        // positive prior: decrements and jumps
        state.cdb[0].macro_step = 9;
        state.macro_loop(0, 3, 4);
        assert_eq!(state.cdb[0].loop_count, 1);
        assert_eq!(state.cdb[0].macro_step, 4);
        state.macro_loop(0, 3, 4);
        assert_eq!(state.cdb[0].loop_count, 0);
        // zero prior: releases without jumping
        state.cdb[0].macro_step = 9;
        state.macro_loop(0, 3, 4);
        assert_eq!(state.cdb[0].loop_count, -1);
        assert_eq!(state.cdb[0].macro_step, 9);
    }

    #[test]
    fn note_setting_opcode_yields_the_tick() {
        let module = macro_module(&[
            0x0918_0000, // set note 24
            0x0E00_0020, // volume 32, must not run on the first pass
            0x0700_0000,
        ]);
        let mut state = armed_state(&module);
        state.tick(&module);
        assert_eq!(state.cdb[0].dest_period, 0x1AC);
        assert_eq!(state.cdb[0].cur_vol, 0);
        state.tick(&module);
        assert_eq!(state.cdb[0].cur_vol, 0x20);
    }

    #[test]
    fn dma_on_arms_voice_with_saved_region() {
        let module = macro_module(&[
            0x0200_0004, // begin 4
            0x0300_0010, // length 16 words
            0x0100_0000, // DMA on
            0x0700_0000,
        ]);
        let mut state = armed_state(&module);
        state.tick(&module);
        let hw = &state.hdb[0];
        assert!(hw.mode.contains(VoiceMode::ENABLED));
        assert_eq!(hw.sample_start, 4);
        assert_eq!(hw.sample_len, 32);
        assert!(!state.cdb[0].macro_run);
    }

    #[test]
    fn zero_length_region_uses_full_bank_span() {
        let module = macro_module(&[0x0200_0000, 0x0100_0000, 0x0700_0000]);
        let mut state = armed_state(&module);
        state.tick(&module);
        assert_eq!(state.hdb[0].sample_len, 131_072);
    }

    #[test]
    fn dma_off_clears_mode_and_length() {
        let module = macro_module(&[
            0x0200_0000,
            0x0300_0008,
            0x0100_0000, // DMA on
            0x0400_0001, // wait one tick
            0x1300_0000, // DMA off
            0x0700_0000,
        ]);
        let mut state = armed_state(&module);
        state.tick(&module); // begin/len/on, wait loads and yields
        assert!(state.hdb[0].mode.contains(VoiceMode::ENABLED));
        state.tick(&module); // wait elapses, DMA off, stop
        state.tick(&module);
        assert!(state.hdb[0].mode.is_empty());
        assert_eq!(state.hdb[0].slen, 0);
    }

    #[test]
    fn add_volume_scales_velocity() {
        let module = macro_module(&[
            0x0D00_0005, // velocity * 3 + 5
            0x0700_0000,
        ]);
        let mut state = armed_state(&module);
        state.tick(&module);
        assert_eq!(state.cdb[0].cur_vol, 15 * 3 + 5);
    }

    #[test]
    fn volume_is_clamped_to_hardware_range() {
        let module = macro_module(&[
            0x0D00_0040, // velocity * 3 + 64 would exceed the range
            0x0700_0000,
        ]);
        let mut state = armed_state(&module);
        state.tick(&module);
        assert_eq!(state.cdb[0].cur_vol, 0x40);
    }

    #[test]
    fn gosub_and_return_use_the_saved_frame() {
        let module = build_module(
            &[idle_line()],
            &[&[0x9800_F000, 0xF400_0000]],
            &[
                &[
                    0x1501_0000, // call macro 1
                    0x0E00_0021, // runs after the return
                    0x0700_0000,
                ],
                &[
                    0x0E00_0011, // volume 17
                    0x1600_0000, // return
                ],
            ],
            125,
            Vec::new(),
        );
        let mut state = armed_state(&module);
        state.tick(&module);
        assert_eq!(state.cdb[0].cur_vol, 0x21);
    }

    #[test]
    fn cue_opcode_writes_signal_slot() {
        let module = macro_module(&[
            0x2001_1234, // cue slot 1
            0x0700_0000,
        ]);
        let mut state = armed_state(&module);
        state.tick(&module);
        assert_eq!(state.signal[1], 0x1234);
    }

    #[test]
    fn sfx_lock_drops_note_commands() {
        let module = two_position_module();
        let mut state = PlayerState::new(44100);
        state.start_song(&module, 0, false);
        state.note_port(&module, 0xFC20_0005); // lock voice 0 for 5 ticks
        assert_eq!(state.cdb[0].sfx_flag, 0x20);
        state.note_port(&module, 0x1800_F000);
        assert!(!state.cdb[0].macro_run);
    }

    #[test]
    fn sfx_lock_expires_with_time() {
        let module = two_position_module();
        let mut state = PlayerState::new(44100);
        state.note_port(&module, 0xFC20_0001);
        for _ in 0..3 {
            state.do_macro(&module, 0);
        }
        assert_eq!(state.cdb[0].sfx_flag, 0);
    }

    #[test]
    fn key_up_command_releases_the_key() {
        let module = two_position_module();
        let mut state = armed_state(&module);
        assert!(state.cdb[0].key_up);
        state.note_port(&module, 0xF500_0000);
        assert!(!state.cdb[0].key_up);
    }

    #[test]
    fn unknown_opcodes_are_inert() {
        let module = macro_module(&[
            0x1B00_0000, // random: inert
            0x1E00_0000, // add volume + note: inert
            0x0E00_0022,
            0x0700_0000,
        ]);
        let mut state = armed_state(&module);
        state.tick(&module);
        assert_eq!(state.cdb[0].cur_vol, 0x22);
    }
}
