//! The fixed-point mixer: burst sizing from the tempo register, per-voice
//! resampling with the 14-bit fractional phase, the channel-to-side
//! summing, and the optional low-pass and stereo-blend post-processing.
use super::channel::{Controller, Voice};
use super::flags::{LoopMode, PlayerQuirks, VoiceMode};
use super::player::PlayerState;
use super::TfmxModule;

/// The sequencer's nominal clock, in Hz.
pub(crate) const ECLOCK_RATE: u32 = 357_955;
/// The period reference clock, in Hz.
const CHIP_CLOCK: u64 = 3_579_545;
/// Capacity of the mix buffer; one tick never produces more frames.
pub const MIX_BURST_MAX: usize = 8192;
/// Sample-region byte length substituted for a zero saved length.
pub(crate) const DEFAULT_SAMPLE_LEN: u32 = 131_072;
/// Fixed-point region ends below this kill the voice instead of looping.
const REGION_MIN: u32 = 0x10000;

/// Converts a period into a 14-bit fractional phase increment.
#[inline]
pub(crate) fn period_to_delta(period: u16, rate: u32) -> u32 {
    if period == 0 {
        return 0;
    }
    let divisor = (u64::from(period) * u64::from(rate)) >> 5;
    if divisor == 0 {
        return 0;
    }
    ((CHIP_CLOCK << 9) / divisor) as u32
}

impl PlayerState {
    /// Number of output frames covering one tick of `e_clocks`, with the
    /// fractional remainder carried across ticks in `e_rem`.
    pub(crate) fn burst_len(&mut self) -> usize {
        let clocks = u64::from(self.mdb.e_clocks) * u64::from(self.rate >> 1);
        let mut burst = (clocks / u64::from(ECLOCK_RATE)) as usize;
        self.e_rem += (clocks % u64::from(ECLOCK_RATE)) as u32;
        if self.e_rem >= ECLOCK_RATE {
            self.e_rem -= ECLOCK_RATE;
            burst += 1;
        }
        burst.clamp(1, MIX_BURST_MAX)
    }

    /// Sums all voices into the left/right accumulators for one burst.
    pub(crate) fn mix_burst(&mut self, module: &TfmxModule, burst: usize) {
        let Self {
            hdb,
            cdb,
            buf_l,
            buf_r,
            mdb,
            quirks,
            ..
        } = self;
        buf_l[..burst].fill(0);
        buf_r[..burst].fill(0);
        let oversample = quirks.contains(PlayerQuirks::OVERSAMPLING);
        let samples = &module.samples;
        // voices 0 and 3 sit left, 1 and 2 right; the timeshared voices
        // all land left
        mix_voice(&mut hdb[0], cdb, samples, &mut buf_l[..burst], oversample);
        mix_voice(&mut hdb[3], cdb, samples, &mut buf_l[..burst], oversample);
        mix_voice(&mut hdb[1], cdb, samples, &mut buf_r[..burst], oversample);
        mix_voice(&mut hdb[2], cdb, samples, &mut buf_r[..burst], oversample);
        if mdb.multimode {
            for n in 4..8 {
                mix_voice(&mut hdb[n], cdb, samples, &mut buf_l[..burst], oversample);
            }
        }
    }

    /// Applies the low-pass and stereo blend, then converts the burst into
    /// pending float frames.
    pub(crate) fn postprocess(&mut self, burst: usize) {
        if self.filter_level != 0 {
            let (input_w, state_w) = match self.filter_level {
                1 => (3, 1),
                2 => (2, 2),
                _ => (1, 3),
            };
            let [mut l1, mut l2] = self.filt_l;
            let [mut r1, mut r2] = self.filt_r;
            for n in 0..burst {
                l1 = (self.buf_l[n] * input_w + l1 * state_w) / 4;
                l2 = (l1 * input_w + l2 * state_w) / 4;
                self.buf_l[n] = l2;
                r1 = (self.buf_r[n] * input_w + r1 * state_w) / 4;
                r2 = (r1 * input_w + r2 * state_w) / 4;
                self.buf_r[n] = r2;
            }
            self.filt_l = [l1, l2];
            self.filt_r = [r1, r2];
        }
        if self.quirks.contains(PlayerQuirks::BLEND) {
            for n in 0..burst {
                let l = self.buf_l[n];
                let r = self.buf_r[n];
                self.buf_l[n] = (11 * l + 5 * r) / 16;
                self.buf_r[n] = (11 * r + 5 * l) / 16;
            }
        }
        for n in 0..burst {
            self.pend_l[n] = self.buf_l[n] as f32 / 32768.0;
            self.pend_r[n] = self.buf_r[n] as f32 / 32768.0;
        }
        self.pend_len = burst;
        self.pend_pos = 0;
    }
}

/// Resamples one voice into an accumulator. The phase wraps against the
/// fixed-point region end; each wrap reloads the saved region and consults
/// the loop mode, killing the voice when the region has collapsed.
fn mix_voice(
    hw: &mut Voice,
    cdb: &mut [Controller],
    samples: &[u8],
    out: &mut [i32],
    oversample: bool,
) {
    if !hw.mode.contains(VoiceMode::ENABLED) {
        return;
    }
    if hw.mode == VoiceMode::ENABLED {
        // just armed: latch the region
        hw.sbeg = hw.sample_start;
        hw.slen = hw.sample_len;
        hw.pos = 0;
        hw.mode |= VoiceMode::STARTED;
    }
    let mut end = hw.slen << 14;
    if end < REGION_MIN {
        return;
    }
    if hw.vol == 0 && hw.delta == 0 {
        return;
    }
    let vol = hw.vol;
    let delta = hw.delta;
    let mut pos = hw.pos;
    for acc in out.iter_mut() {
        pos = pos.wrapping_add(delta);
        let index = hw.sbeg.wrapping_add(pos >> 14) as usize;
        let value = if oversample {
            let s0 = sample_at(samples, index);
            let s1 = sample_at(samples, index + 1);
            s0 + (((s1 - s0) * (pos & 0x3FFF) as i32) >> 14)
        } else {
            sample_at(samples, index)
        };
        *acc += vol * value;
        if pos >= end {
            pos -= end;
            hw.sbeg = hw.sample_start;
            hw.slen = hw.sample_len;
            end = hw.slen << 14;
            if end < REGION_MIN
                || hw.mode.contains(VoiceMode::ONE_SHOT)
                || !voice_loop(hw, &mut cdb[hw.owner])
            {
                hw.mode = VoiceMode::empty();
                hw.delta = 0;
                hw.slen = 0;
                pos = 0;
                break;
            }
        }
    }
    hw.pos = pos;
}

fn voice_loop(hw: &mut Voice, c: &mut Controller) -> bool {
    match hw.looper {
        LoopMode::Off => true,
        LoopMode::WaitDma => {
            c.wait_dma_count = c.wait_dma_count.wrapping_sub(1);
            if c.wait_dma_count == 0 {
                c.macro_run = true;
                hw.looper = LoopMode::Off;
            }
            true
        }
    }
}

#[inline(always)]
fn sample_at(samples: &[u8], index: usize) -> i32 {
    samples.get(index).map_or(0, |&byte| i32::from(byte as i8))
}
