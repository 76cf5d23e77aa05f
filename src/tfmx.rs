use core::fmt;

use arrayvec::ArrayVec;

pub mod flags;

mod channel;
mod effects;
mod macros;
mod mixer;
mod parse;
mod player;

use channel::VOICES;
use flags::PlayerQuirks;
use player::PlayerState;

pub use mixer::MIX_BURST_MAX;

/// Number of sub-song slots in the module header.
pub const MAX_SUB_SONGS: usize = 32;
/// Number of text lines in the module header.
pub const TEXT_LINES: usize = 6;
/// Size of each header text line in bytes.
pub const TEXT_LINE_LEN: usize = 40;
/// Upper bound of the pattern and macro start-offset tables.
pub const MAX_TABLE_ENTRIES: usize = 128;

/// Tempo register value corresponding to the stock 50 Hz tick.
pub const DEFAULT_E_CLOCKS: u32 = 14318;

/// Divisor turning a tempo word into `e_clocks`.
pub(crate) const CIA_BASE_CLOCK: u32 = 0x1B51F8;

/// Note-index to period lookup. Six octaves plus the historical wrap rows
/// that alias the top entries back into the middle range.
pub const NOTEVALS: [u16; 64] = [
    0x6AE, 0x64E, 0x5F4, 0x59E, 0x54D, 0x501, 0x4B9, 0x475,
    0x435, 0x3F9, 0x3C0, 0x38C, 0x358, 0x32A, 0x2FC, 0x2D0,
    0x2A8, 0x282, 0x25E, 0x23B, 0x21B, 0x1FD, 0x1E0, 0x1C6,
    0x1AC, 0x194, 0x17D, 0x168, 0x154, 0x140, 0x12F, 0x11E,
    0x10E, 0x0FE, 0x0F0, 0x0E3, 0x0D6, 0x0CA, 0x0BF, 0x0B4,
    0x0AA, 0x0A0, 0x097, 0x08F, 0x087, 0x07F, 0x078, 0x071,
    0x0D6, 0x0CA, 0x0BF, 0x0B4, 0x0AA, 0x0A0, 0x097, 0x08F,
    0x087, 0x07F, 0x078, 0x071, 0x0D6, 0x0CA, 0x0BF, 0x0B4,
];

/// The fixed part of the **TFMX** music-data file.
///
/// ```text
/// offset  size  content
/// ------------------------------------------------------------------
///  0x000    10  ASCII magic ("TFMX-SONG ", "TFMX_SONG ", ...)
///  0x010   240  six 40-byte text lines (raw, padding preserved)
///  0x100    64  32 big-endian words: sub-song first positions
///  0x140    64  32 big-endian words: sub-song last positions
///  0x180    64  32 big-endian words: sub-song tempos
///  0x1D0     4  trackstep table file offset (0 selects the default)
///  0x1D4     4  pattern table file offset (0 selects the default)
///  0x1D8     4  macro table file offset (0 selects the default)
///  0x200        start of the 32-bit big-endian word stream
/// ```
#[derive(Debug, Clone)]
pub struct TfmxHeader {
    /// The raw file signature.
    pub magic: [u8; 10],
    /// The header text lines, null padding preserved.
    pub text: [[u8; TEXT_LINE_LEN]; TEXT_LINES],
    /// First trackstep position of each sub-song.
    pub start: [u16; MAX_SUB_SONGS],
    /// Last trackstep position of each sub-song.
    pub end: [u16; MAX_SUB_SONGS],
    /// Tempo word of each sub-song; below 16 it is a tick prescale instead.
    pub tempo: [u16; MAX_SUB_SONGS],
}

/// The **TFMX** music module: the parsed music-data file plus the raw
/// sample bank.
///
/// A module is immutable after parsing. All trackstep, pattern and macro
/// material lives in [TfmxModule::words], a single array of host-order
/// 32-bit values decoded from the big-endian file, addressed through the
/// start-offset tables.
#[derive(Debug, Clone)]
pub struct TfmxModule {
    /// The fixed file header.
    pub header: TfmxHeader,
    /// The post-header word stream, with a `-1` sentinel appended.
    pub words: Box<[i32]>,
    /// Word indices of the pattern programs.
    pub patterns: ArrayVec<u32, MAX_TABLE_ENTRIES>,
    /// Word indices of the macro programs.
    pub macros: ArrayVec<u32, MAX_TABLE_ENTRIES>,
    /// Word index of the trackstep table.
    pub trackstart: u32,
    /// Word index of the pattern start-offset table.
    pub pattstart: u32,
    /// Word index of the macro start-offset table.
    pub macrostart: u32,
    /// Number of four-word trackstep lines before the first pattern.
    pub num_tracksteps: u32,
    /// The raw 8-bit signed PCM sample bank.
    pub samples: Box<[u8]>,
}

impl TfmxModule {
    /// Returns the number of playable sub-songs: the largest `n + 1` for
    /// which the sub-song's last position is non-zero.
    pub fn sub_song_count(&self) -> usize {
        (0..MAX_SUB_SONGS)
            .rev()
            .find(|&n| self.header.end[n] > 0)
            .map_or(0, |n| n + 1)
    }

    /// Returns one of the six header text lines with trailing padding
    /// removed.
    pub fn text_line(&self, line: usize) -> String {
        String::from_utf8_lossy(&self.header.text[line % TEXT_LINES])
            .trim_end_matches(|c: char| c == '\0' || c == ' ')
            .to_string()
    }

    /// Reads a word, treating anything outside the stream as zero.
    #[inline]
    pub(crate) fn word(&self, index: u32) -> i32 {
        self.words.get(index as usize).copied().unwrap_or(0)
    }

    /// Word index of pattern `num`, 0 when the table has no such entry.
    #[inline]
    pub(crate) fn pattern_index(&self, num: u8) -> u32 {
        self.patterns.get(num as usize).copied().unwrap_or(0)
    }

    /// Word index of macro `num`, 0 when the table has no such entry.
    #[inline]
    pub(crate) fn macro_index(&self, num: u8) -> u32 {
        self.macros.get(num as usize).copied().unwrap_or(0)
    }
}

impl fmt::Display for TfmxModule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "TFMX module: {} sub-songs, {} words, {} patterns, {} macros, {} sample bytes",
            self.sub_song_count(),
            self.words.len(),
            self.patterns.len(),
            self.macros.len(),
            self.samples.len()
        )
    }
}

/// One track's cursor as reported by [TfmxPlayer::display_state].
#[derive(Debug, Clone, Copy, Default)]
pub struct TrackView {
    /// The pattern number assigned by the current trackstep line.
    pub pattern_num: u8,
    /// The step index inside the pattern.
    pub step: u32,
    /// True while the cursor advances through pattern data.
    pub active: bool,
}

/// A snapshot of the playback position for display purposes.
#[derive(Debug, Clone, Copy, Default)]
pub struct PlaybackState {
    /// The current position in the trackstep table.
    pub position: u16,
    /// Per-track cursor state.
    pub tracks: [TrackView; VOICES],
    /// Current hardware-voice volumes, `0..=64`.
    pub voice_volumes: [u8; VOICES],
    /// True when a pattern override (`PPat`) is in effect.
    pub pattern_override: bool,
    /// False once the player has reached a stable silent state.
    pub active_any: bool,
}

/// The playback engine: drives a loaded [TfmxModule] through its trackstep,
/// pattern and macro state machines and mixes the eight voices into stereo
/// float frames.
///
/// The player is single-threaded by design; call [TfmxPlayer::render] from
/// the audio pump and nothing else concurrently. All malformed-module
/// conditions are absorbed during playback: [TfmxPlayer::render] never
/// fails, it produces silence instead.
pub struct TfmxPlayer {
    module: Option<TfmxModule>,
    state: PlayerState,
}

impl TfmxPlayer {
    /// Creates a player producing frames at `output_rate` Hz.
    pub fn new(output_rate: u32) -> TfmxPlayer {
        TfmxPlayer {
            module: None,
            state: PlayerState::new(output_rate),
        }
    }

    /// Installs a module, resetting all playback state.
    pub fn load(&mut self, module: TfmxModule) {
        self.state.init();
        self.module = Some(module);
    }

    /// Returns the loaded module, if any.
    pub fn module(&self) -> Option<&TfmxModule> {
        self.module.as_ref()
    }

    /// Resets all playback state without touching the module.
    pub fn init(&mut self) {
        self.state.init();
    }

    /// Starts sub-song `song` from its first position. With `cont` the
    /// trackstep position is kept and only tempo and voices are reset.
    pub fn start_song(&mut self, song: usize, cont: bool) {
        if let Some(module) = self.module.as_ref() {
            self.state.start_song(module, song, cont);
        }
    }

    /// Stops playback and silences all voices.
    pub fn stop(&mut self) {
        self.state.all_off();
    }

    /// Advances the state machines by one tick without producing audio.
    pub fn tick(&mut self) {
        if let Some(module) = self.module.as_ref() {
            self.state.tick(module);
        }
    }

    /// Parks a note command that plays macro `macro_num` on the first voice
    /// at the next tick boundary. `0x1E` is the customary audition note.
    pub fn trigger_macro(&mut self, macro_num: u8, note: u8) {
        self.state.cdb[0].sfx_code = (u32::from(note & 0x3F) << 24)
            | (u32::from(macro_num) << 16)
            | 0xF000;
    }

    /// Prepares the player for macro auditioning without a running song.
    pub fn enable_preview(&mut self) {
        if self.state.mdb.e_clocks == 0 {
            self.state.mdb.e_clocks = DEFAULT_E_CLOCKS;
        }
        self.state.mdb.master_vol = 0x40;
    }

    /// Produces `left.len().min(right.len())` stereo float frames in
    /// `[-1, 1]`, driving ticks and the mixer as needed. Without a module
    /// the buffers are filled with silence.
    pub fn render(&mut self, left: &mut [f32], right: &mut [f32]) {
        match self.module.as_ref() {
            Some(module) => self.state.render(module, left, right),
            None => {
                left.fill(0.0);
                right.fill(0.0);
            }
        }
    }

    /// Returns a snapshot of the playback position.
    pub fn display_state(&self) -> PlaybackState {
        self.state.snapshot()
    }

    /// Reads one of the four cue slots written by pattern and macro
    /// commands.
    pub fn signal(&self, slot: usize) -> u16 {
        self.state.signal[slot & 3]
    }

    /// The sub-song most recently given to [TfmxPlayer::start_song].
    pub fn current_song(&self) -> usize {
        self.state.mdb.current_song
    }

    /// Suppresses (or restores) note dispatch on one track. Timing and
    /// structural pattern commands still execute while muted.
    pub fn set_track_muted(&mut self, track: usize, muted: bool) {
        if track < VOICES {
            self.state.muted[track] = muted;
        }
    }

    /// Replaces the compatibility and output toggles.
    pub fn set_quirks(&mut self, quirks: PlayerQuirks) {
        self.state.quirks = quirks;
    }

    /// The active compatibility and output toggles.
    pub fn quirks(&self) -> PlayerQuirks {
        self.state.quirks
    }

    /// Sets the low-pass strength, 0 (off) to 3.
    pub fn set_filter_level(&mut self, level: u8) {
        self.state.filter_level = level.min(3);
    }

    /// Sets the loop policy: 0 plays forever, a positive count stops after
    /// that many passes over the sub-song loop, negative stops at the
    /// sub-song end.
    pub fn set_loops(&mut self, loops: i32) {
        self.state.loops = loops;
    }

    /// The output rate the player was created with.
    pub fn output_rate(&self) -> u32 {
        self.state.rate
    }
}
