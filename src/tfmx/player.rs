//! The playback core: lifecycle, the track sequencer and the pattern
//! interpreter.
//!
//! One tick runs the macro pass over every controller (0, 1, 2, the
//! timeshared voices 4..7, then the effects voice 3), advances the master
//! fade, and finally, while a sub-song is active, the sequencer and the
//! per-track pattern cursors. The mixer then turns the tick's `e_clocks`
//! period into a burst of output frames.
use log::{debug, trace, warn};

use super::channel::{Controller, Master, PatternBlock, PatternCursor, Voice, CONTROLLER_SLOTS, VOICES};
use super::flags::PlayerQuirks;
use super::mixer::MIX_BURST_MAX;
use super::{PlaybackState, TfmxModule, TrackView, CIA_BASE_CLOCK, MAX_SUB_SONGS};

/// Instruction budget for one track's pattern pass within a tick.
const PATTERN_FUSE: usize = 1024;
/// Budget for trackstep meta-rows handled by one `load_trackstep` call.
const TRACKSTEP_FUSE: usize = 64;
/// Budget for "restart from track 0" rounds within one sequencer pass.
const TRACK_RESTART_FUSE: usize = 64;

/// All mutable playback state, separated from the immutable module so the
/// interpreters can borrow both at once.
pub(crate) struct PlayerState {
    pub(crate) rate: u32,
    pub(crate) quirks: PlayerQuirks,
    pub(crate) filter_level: u8,
    pub(crate) loops: i32,
    pub(crate) muted: [bool; VOICES],
    pub(crate) mdb: Master,
    pub(crate) pdb: PatternBlock,
    pub(crate) cdb: [Controller; CONTROLLER_SLOTS],
    pub(crate) hdb: [Voice; VOICES],
    pub(crate) signal: [u16; 4],
    pub(crate) e_rem: u32,
    pub(crate) buf_l: Vec<i32>,
    pub(crate) buf_r: Vec<i32>,
    pub(crate) pend_l: Vec<f32>,
    pub(crate) pend_r: Vec<f32>,
    pub(crate) pend_pos: usize,
    pub(crate) pend_len: usize,
    pub(crate) filt_l: [i32; 2],
    pub(crate) filt_r: [i32; 2],
}

impl PlayerState {
    pub(crate) fn new(rate: u32) -> PlayerState {
        let mut state = PlayerState {
            rate,
            quirks: PlayerQuirks::default(),
            filter_level: 0,
            loops: 0,
            muted: [false; VOICES],
            mdb: Master::default(),
            pdb: PatternBlock::default(),
            cdb: [Controller::default(); CONTROLLER_SLOTS],
            hdb: [Voice::default(); VOICES],
            signal: [0; 4],
            e_rem: 0,
            buf_l: vec![0; MIX_BURST_MAX],
            buf_r: vec![0; MIX_BURST_MAX],
            pend_l: vec![0.0; MIX_BURST_MAX],
            pend_r: vec![0.0; MIX_BURST_MAX],
            pend_pos: 0,
            pend_len: 0,
            filt_l: [0; 2],
            filt_r: [0; 2],
        };
        state.init();
        state
    }

    /// Full reset: master and pattern blocks, controllers, voices, cues.
    pub(crate) fn init(&mut self) {
        self.mdb = Master::default();
        self.pdb = PatternBlock::default();
        self.signal = [0; 4];
        self.e_rem = 0;
        self.pend_pos = 0;
        self.pend_len = 0;
        self.filt_l = [0; 2];
        self.filt_r = [0; 2];
        for (n, c) in self.cdb.iter_mut().enumerate() {
            *c = Controller::default();
            c.hw = n & (VOICES - 1);
        }
        for (n, hw) in self.hdb.iter_mut().enumerate() {
            *hw = Voice::default();
            hw.owner = n;
        }
    }

    /// Disables the player and silences every controller and voice. Any
    /// already-mixed frames are dropped.
    pub(crate) fn all_off(&mut self) {
        self.mdb.enabled = false;
        self.pend_pos = 0;
        self.pend_len = 0;
        for c in self.cdb.iter_mut() {
            c.reset();
        }
        for hw in self.hdb.iter_mut() {
            hw.reset();
        }
    }

    pub(crate) fn start_song(&mut self, module: &TfmxModule, song: usize, cont: bool) {
        let song = song.min(MAX_SUB_SONGS - 1);
        self.all_off();
        self.mdb.master_vol = 0x40;
        self.mdb.fade_slope = 0;
        self.mdb.track_loop = -1;
        self.mdb.play_patt_flag = false;
        if !cont {
            let first = module.header.start[song];
            self.pdb.first_pos = first;
            self.pdb.current_pos = first;
            self.pdb.last_pos = module.header.end[song];
        }
        let tempo = u32::from(module.header.tempo[song]);
        if tempo >= 0x10 {
            self.mdb.e_clocks = CIA_BASE_CLOCK / tempo;
            self.pdb.prescale = 0;
        } else {
            self.pdb.prescale = tempo as u16;
        }
        for cursor in self.pdb.cursors.iter_mut() {
            *cursor = PatternCursor::default();
        }
        // enable first: a stop meta-row in the opening line must win
        self.mdb.enabled = true;
        self.load_trackstep(module);
        self.mdb.speed_count = 0;
        self.mdb.current_song = song;
        debug!(
            "song {} started: positions {}..{}, eClocks {}",
            song, self.pdb.first_pos, self.pdb.last_pos, self.mdb.e_clocks
        );
    }

    /// One full sequencer tick.
    pub(crate) fn tick(&mut self, module: &TfmxModule) {
        self.do_macro(module, 0);
        self.do_macro(module, 1);
        self.do_macro(module, 2);
        if self.mdb.multimode {
            for cc in 4..VOICES {
                self.do_macro(module, cc);
            }
        }
        self.do_macro(module, 3);
        self.do_fade();
        if self.mdb.enabled {
            self.do_tracks(module);
        }
    }

    /// The sequencer pass: every `prescale + 1` ticks each track cursor is
    /// advanced; an executed End command restarts the scan from track 0.
    fn do_tracks(&mut self, module: &TfmxModule) {
        let prior = self.mdb.speed_count;
        self.mdb.speed_count = prior.wrapping_sub(1);
        if prior != 0 {
            return;
        }
        self.mdb.speed_count = i32::from(self.pdb.prescale);
        let mut restarts = 0;
        let mut track = 0;
        while track < VOICES {
            if self.do_track(module, track) {
                restarts += 1;
                if restarts > TRACK_RESTART_FUSE {
                    warn!("trackstep storm, stopping the player");
                    self.mdb.enabled = false;
                    return;
                }
                track = 0;
                continue;
            }
            track += 1;
        }
    }

    /// Runs one track's pattern cursor. Returns true when the trackstep
    /// position advanced (an End command executed).
    fn do_track(&mut self, module: &TfmxModule, track: usize) -> bool {
        if self.pdb.cursors[track].num == 0xFE {
            // silence request: the transpose byte carries the voice index
            let voice = self.pdb.cursors[track].xpose as u8 as usize;
            self.channel_off(voice & (VOICES - 1));
            self.pdb.cursors[track].num = 0xFF;
            return false;
        }
        {
            let cursor = &mut self.pdb.cursors[track];
            if (cursor.addr == 0 && cursor.num != 0) || cursor.num >= 0x90 {
                return false;
            }
            if cursor.wait > 0 {
                cursor.wait -= 1;
                return false;
            }
        }
        for _ in 0..PATTERN_FUSE {
            let (addr, step) = {
                let cursor = &self.pdb.cursors[track];
                (cursor.addr, cursor.step)
            };
            let Some(&raw) = module.words.get(addr.wrapping_add(step) as usize) else {
                self.pdb.cursors[track].num = 0xFF;
                return false;
            };
            let word = raw as u32;
            self.pdb.cursors[track].step = step.wrapping_add(1);
            let byte0 = (word >> 24) as u8;

            if byte0 < 0xF0 {
                let with_wait = byte0 & 0xC0 == 0x80;
                let command = {
                    let cursor = &mut self.pdb.cursors[track];
                    let mut word = word;
                    if with_wait {
                        cursor.wait = (word & 0xFF) as u8;
                        word &= 0xFFFF_FF00;
                    }
                    let note = byte0.wrapping_add(cursor.xpose as u8) & 0x3F;
                    (word & 0x00FF_FFFF) | (u32::from(note | (byte0 & 0xC0)) << 24)
                };
                if !self.muted[track] {
                    self.note_port(module, command);
                }
                if with_wait {
                    return false;
                }
                continue;
            }

            let param_a = ((word >> 16) & 0xFF) as u8;
            let halfword = (word & 0xFFFF) as u16;
            match byte0 & 0x0F {
                0x0 => {
                    // End: wrap or advance the trackstep position
                    self.pdb.cursors[track].num = 0xFF;
                    if self.pdb.current_pos == self.pdb.last_pos {
                        self.pdb.current_pos = self.pdb.first_pos;
                    } else {
                        self.pdb.current_pos = self.pdb.current_pos.wrapping_add(1);
                    }
                    self.load_trackstep(module);
                    return true;
                }
                0x1 => {
                    let cursor = &mut self.pdb.cursors[track];
                    if cursor.loops == 0 {
                        cursor.loops = 0xFFFF;
                        continue;
                    }
                    if cursor.loops == 0xFFFF {
                        cursor.loops = u16::from(param_a);
                    }
                    cursor.loops = cursor.loops.wrapping_sub(1);
                    cursor.step = u32::from(halfword);
                }
                0x2 => {
                    let cursor = &mut self.pdb.cursors[track];
                    cursor.addr = module.pattern_index(param_a);
                    cursor.step = u32::from(halfword);
                }
                0x3 => {
                    self.pdb.cursors[track].wait = param_a;
                    return false;
                }
                0x4 => {
                    self.pdb.cursors[track].num = 0xFF;
                    return false;
                }
                0x5 | 0x6 | 0x7 | 0xC => {
                    if !self.muted[track] {
                        self.note_port(module, word);
                    }
                }
                0x8 => {
                    let cursor = &mut self.pdb.cursors[track];
                    cursor.ret_addr = cursor.addr;
                    cursor.ret_step = cursor.step;
                    cursor.addr = module.pattern_index(param_a);
                    cursor.step = u32::from(halfword);
                }
                0x9 => {
                    let cursor = &mut self.pdb.cursors[track];
                    cursor.addr = cursor.ret_addr;
                    cursor.step = cursor.ret_step;
                }
                0xA => {
                    self.start_fade(param_a, (word & 0xFF) as u8);
                }
                0xB => {
                    // retarget another track's cursor
                    let target = ((word >> 8) & 0x7) as usize;
                    let cursor = &mut self.pdb.cursors[target];
                    cursor.num = param_a;
                    cursor.addr = module.pattern_index(param_a);
                    cursor.xpose = (word & 0xFF) as u8 as i8;
                    cursor.step = 0;
                    cursor.wait = 0;
                    cursor.loops = 0xFFFF;
                    self.mdb.play_patt_flag = true;
                }
                0xD => {
                    self.signal[(param_a & 3) as usize] = halfword;
                }
                0xE => {
                    self.mdb.play_patt_flag = false;
                    self.pdb.cursors[track].num = 0xFF;
                    return false;
                }
                _ => {}
            }
        }
        warn!("pattern runaway on track {}, parking the cursor", track);
        self.pdb.cursors[track].num = 0xFF;
        false
    }

    /// Loads the trackstep line at the current position, consuming any
    /// meta-rows on the way to the next pattern-assignment row.
    pub(crate) fn load_trackstep(&mut self, module: &TfmxModule) {
        for _ in 0..TRACKSTEP_FUSE {
            if u32::from(self.pdb.current_pos) >= module.num_tracksteps {
                debug!("trackstep table exhausted at {}", self.pdb.current_pos);
                self.mdb.enabled = false;
                return;
            }
            let base = module
                .trackstart
                .wrapping_add(u32::from(self.pdb.current_pos) * 4);
            let mut half = [0u16; 8];
            for n in 0..4 {
                let word = module.word(base.wrapping_add(n as u32)) as u32;
                half[n * 2] = (word >> 16) as u16;
                half[n * 2 + 1] = (word & 0xFFFF) as u16;
            }

            if half[0] == 0xEFFE {
                match half[1] {
                    0x00 => {
                        debug!("trackstep stop at {}", self.pdb.current_pos);
                        self.mdb.enabled = false;
                        return;
                    }
                    0x01 => {
                        if self.loops > 0 {
                            self.loops -= 1;
                            if self.loops == 0 {
                                self.mdb.enabled = false;
                                return;
                            }
                        } else if self.loops < 0 {
                            self.mdb.enabled = false;
                            return;
                        }
                        let prior = self.mdb.track_loop;
                        self.mdb.track_loop = prior.wrapping_sub(1);
                        if prior == 0 {
                            self.pdb.current_pos = self.pdb.current_pos.wrapping_add(1);
                            continue;
                        }
                        if prior < 0 {
                            self.mdb.track_loop = i32::from(half[3]);
                        }
                        self.pdb.current_pos = half[2];
                    }
                    0x02 => {
                        self.pdb.prescale = half[2];
                        self.mdb.speed_count = i32::from(half[2]);
                        if half[3] & 0xF200 == 0 && half[3] & 0x1FF > 0xF {
                            self.mdb.e_clocks = CIA_BASE_CLOCK / u32::from(half[3] & 0x1FF);
                        }
                        self.pdb.current_pos = self.pdb.current_pos.wrapping_add(1);
                    }
                    0x03 => {
                        if half[3] & 0x8000 == 0 {
                            let x = i32::from((half[3] & 0xFF) as u8 as i8).max(-0x20);
                            self.mdb.e_clocks = (14318 * (x + 100) / 100) as u32;
                            self.mdb.multimode = true;
                        }
                        self.pdb.current_pos = self.pdb.current_pos.wrapping_add(1);
                    }
                    0x04 => {
                        self.start_fade((half[2] & 0xFF) as u8, (half[3] & 0xFF) as u8);
                        self.pdb.current_pos = self.pdb.current_pos.wrapping_add(1);
                    }
                    other => {
                        trace!("unknown trackstep control {:#x} skipped", other);
                        self.pdb.current_pos = self.pdb.current_pos.wrapping_add(1);
                    }
                }
                continue;
            }

            for (track, pair) in half.iter().enumerate() {
                let cursor = &mut self.pdb.cursors[track];
                cursor.xpose = (pair & 0xFF) as u8 as i8;
                let num = (pair >> 8) as u8;
                cursor.num = num;
                if num < 0x80 {
                    cursor.addr = module.pattern_index(num);
                    cursor.loops = 0xFFFF;
                    cursor.step = 0;
                    cursor.wait = 0;
                }
            }
            trace!("trackstep {} loaded", self.pdb.current_pos);
            return;
        }
        warn!("trackstep meta-row storm, stopping the player");
        self.mdb.enabled = false;
    }

    /// Produces stereo float frames, driving ticks and the mixer until the
    /// request is satisfied.
    pub(crate) fn render(&mut self, module: &TfmxModule, left: &mut [f32], right: &mut [f32]) {
        let frames = left.len().min(right.len());
        let mut done = 0;
        while done < frames {
            if self.pend_pos >= self.pend_len {
                self.tick(module);
                let burst = self.burst_len();
                self.mix_burst(module, burst);
                self.postprocess(burst);
            }
            let take = (frames - done).min(self.pend_len - self.pend_pos);
            left[done..done + take]
                .copy_from_slice(&self.pend_l[self.pend_pos..self.pend_pos + take]);
            right[done..done + take]
                .copy_from_slice(&self.pend_r[self.pend_pos..self.pend_pos + take]);
            self.pend_pos += take;
            done += take;
        }
    }

    pub(crate) fn snapshot(&self) -> PlaybackState {
        let mut state = PlaybackState {
            position: self.pdb.current_pos,
            pattern_override: self.mdb.play_patt_flag,
            active_any: self.mdb.enabled,
            ..PlaybackState::default()
        };
        for (view, cursor) in state.tracks.iter_mut().zip(self.pdb.cursors.iter()) {
            *view = TrackView {
                pattern_num: cursor.num,
                step: cursor.step,
                active: cursor.addr != 0 && cursor.num < 0x90,
            };
        }
        for (vol, hw) in state.voice_volumes.iter_mut().zip(self.hdb.iter()) {
            *vol = hw.vol.clamp(0, 0x40) as u8;
        }
        state
    }
}
