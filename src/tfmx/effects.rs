//! The per-tick effects pass: address vibrato, pitch vibrato, portamento
//! and the volume envelope on each controller, plus the master fade and the
//! hardware-voice update that closes every controller's tick.
use super::mixer::{period_to_delta, DEFAULT_SAMPLE_LEN};
use super::player::PlayerState;

impl PlayerState {
    /// Runs the effect timers of one controller. The pass is armed by the
    /// DMA-on opcode and skips one tick before the first update.
    pub(crate) fn do_effects(&mut self, cc: usize) {
        let c = &mut self.cdb[cc];
        if c.efx_run < 0 {
            return;
        }
        if c.efx_run == 0 {
            c.efx_run = 1;
            return;
        }

        if c.add_begin_time != 0 {
            c.cur_addr = c.cur_addr.wrapping_add_signed(c.add_begin);
            c.save_addr = c.cur_addr;
            c.add_begin_time -= 1;
            if c.add_begin_time == 0 {
                c.add_begin = -c.add_begin;
                c.add_begin_time = c.add_begin_reset;
            }
        }

        if c.vib_reset != 0 {
            c.vib_offset = c.vib_offset.wrapping_add(i16::from(c.vib_width));
            let period =
                ((i32::from(c.dest_period) * (0x800 + i32::from(c.vib_offset))) >> 11) & 0x7FF;
            if c.porta_rate == 0 {
                c.cur_period = period as u16;
            }
            c.vib_time = c.vib_time.wrapping_sub(1);
            if c.vib_time == 0 {
                c.vib_time = c.vib_reset;
                c.vib_width = c.vib_width.wrapping_neg();
            }
        }

        if c.porta_rate != 0 {
            c.porta_time = c.porta_time.wrapping_sub(1);
            if c.porta_time == 0 {
                c.porta_time = c.porta_reset;
                let dest = i32::from(c.dest_period);
                let mut per = c.porta_per;
                if per > dest {
                    per = (per * (256 - c.porta_rate) - 128) >> 8;
                    if per <= dest {
                        per = dest;
                        c.porta_rate = 0;
                    }
                } else if per < dest {
                    per = (per * (256 + c.porta_rate)) >> 8;
                    if per >= dest {
                        per = dest;
                        c.porta_rate = 0;
                    }
                } else {
                    c.porta_rate = 0;
                }
                c.porta_per = per & 0x7FF;
                c.cur_period = c.porta_per as u16;
            }
        }

        if c.env_reset != 0 {
            c.env_time = c.env_time.wrapping_sub(1);
            if c.env_time == 0 {
                c.env_time = c.env_reset;
                let end = i32::from(c.env_end_vol);
                if c.cur_vol > end {
                    c.cur_vol -= i32::from(c.env_rate);
                    if c.cur_vol <= end {
                        c.cur_vol = end;
                        c.env_reset = 0;
                    }
                } else if c.cur_vol < end {
                    c.cur_vol += i32::from(c.env_rate);
                    if c.cur_vol >= end {
                        c.cur_vol = end;
                        c.env_reset = 0;
                    }
                } else {
                    c.env_reset = 0;
                }
                c.cur_vol = c.cur_vol.clamp(0, 0x40);
            }
        }
    }

    /// Advances the master fade. Runs once per tick, outside the
    /// per-controller effect gate.
    pub(crate) fn do_fade(&mut self) {
        let m = &mut self.mdb;
        if m.fade_slope == 0 {
            return;
        }
        m.fade_time -= 1;
        if m.fade_time > 0 {
            return;
        }
        m.fade_time = m.fade_reset;
        m.master_vol += m.fade_slope;
        if (m.fade_slope < 0 && m.master_vol <= m.fade_dest)
            || (m.fade_slope > 0 && m.master_vol >= m.fade_dest)
        {
            m.master_vol = m.fade_dest;
            m.fade_slope = 0;
        }
    }

    /// Begins a master-volume fade; speed 0 jumps straight to the target.
    pub(crate) fn start_fade(&mut self, speed: u8, dest: u8) {
        let m = &mut self.mdb;
        m.fade_dest = i32::from(dest).min(0x40);
        m.fade_time = i32::from(speed);
        m.fade_reset = i32::from(speed);
        if speed == 0 || m.master_vol == m.fade_dest {
            m.master_vol = m.fade_dest;
            m.fade_slope = 0;
            return;
        }
        m.fade_slope = if m.master_vol < m.fade_dest { 1 } else { -1 };
    }

    /// Mirrors the controller into its hardware voice: phase increment from
    /// the period, sample region from the saved cursors, volume scaled by
    /// the master volume.
    pub(crate) fn update_voice(&mut self, cc: usize) {
        let c = &self.cdb[cc];
        let hw = &mut self.hdb[c.hw];
        hw.delta = period_to_delta(c.cur_period, self.rate);
        hw.sample_start = c.save_addr;
        hw.sample_len = if c.save_len != 0 {
            u32::from(c.save_len) << 1
        } else {
            DEFAULT_SAMPLE_LEN
        };
        hw.vol = (c.cur_vol * self.mdb.master_vol) >> 6;
    }
}

#[cfg(test)]
mod tests {
    use super::super::player::PlayerState;

    #[test]
    fn fade_to_zero_takes_volume_steps_times_speed_ticks() {
        let mut state = PlayerState::new(44100);
        assert_eq!(state.mdb.master_vol, 0x40);
        state.start_fade(2, 0);
        for _ in 0..127 {
            state.do_fade();
        }
        assert!(state.mdb.master_vol > 0);
        state.do_fade();
        assert_eq!(state.mdb.master_vol, 0);
        assert_eq!(state.mdb.fade_slope, 0);
    }

    #[test]
    fn fade_with_zero_speed_jumps_to_target() {
        let mut state = PlayerState::new(44100);
        state.start_fade(0, 0x10);
        assert_eq!(state.mdb.master_vol, 0x10);
        assert_eq!(state.mdb.fade_slope, 0);
    }

    #[test]
    fn fade_up_moves_towards_target() {
        let mut state = PlayerState::new(44100);
        state.mdb.master_vol = 0;
        state.start_fade(1, 0x40);
        for _ in 0..0x40 {
            state.do_fade();
        }
        assert_eq!(state.mdb.master_vol, 0x40);
        assert_eq!(state.mdb.fade_slope, 0);
    }

    #[test]
    fn vibrato_masks_period_to_eleven_bits() {
        let mut state = PlayerState::new(44100);
        let c = &mut state.cdb[0];
        c.efx_run = 1;
        c.dest_period = 0x6AE;
        c.vib_reset = 4;
        c.vib_time = 2;
        c.vib_width = 0x40;
        for _ in 0..32 {
            state.do_effects(0);
            assert!(state.cdb[0].cur_period <= 0x7FF);
        }
    }

    #[test]
    fn vibrato_reverses_direction_on_timeout() {
        let mut state = PlayerState::new(44100);
        let c = &mut state.cdb[0];
        c.efx_run = 1;
        c.dest_period = 0x1AC;
        c.vib_reset = 2;
        c.vib_time = 1;
        c.vib_width = 8;
        state.do_effects(0);
        assert_eq!(state.cdb[0].vib_width, -8);
        state.do_effects(0);
        state.do_effects(0);
        assert_eq!(state.cdb[0].vib_width, 8);
    }

    #[test]
    fn portamento_slides_and_snaps_to_destination() {
        let mut state = PlayerState::new(44100);
        let c = &mut state.cdb[0];
        c.efx_run = 1;
        c.porta_rate = 8;
        c.porta_time = 1;
        c.porta_reset = 1;
        c.porta_per = 0x400;
        c.dest_period = 0x1AC;
        c.cur_period = 0x400;
        for _ in 0..256 {
            state.do_effects(0);
            if state.cdb[0].porta_rate == 0 {
                break;
            }
        }
        assert_eq!(state.cdb[0].porta_rate, 0);
        assert_eq!(state.cdb[0].cur_period, 0x1AC);
    }

    #[test]
    fn envelope_steps_volume_to_target_and_clears() {
        let mut state = PlayerState::new(44100);
        let c = &mut state.cdb[0];
        c.efx_run = 1;
        c.cur_vol = 0x40;
        c.env_rate = 8;
        c.env_reset = 1;
        c.env_time = 1;
        c.env_end_vol = 0x10;
        for _ in 0..6 {
            state.do_effects(0);
        }
        assert_eq!(state.cdb[0].cur_vol, 0x10);
        assert_eq!(state.cdb[0].env_reset, 0);
    }

    #[test]
    fn effects_pass_skips_one_tick_after_arming() {
        let mut state = PlayerState::new(44100);
        let c = &mut state.cdb[0];
        c.efx_run = 0;
        c.env_rate = 8;
        c.env_reset = 1;
        c.env_time = 1;
        c.env_end_vol = 0;
        c.cur_vol = 0x40;
        state.do_effects(0);
        assert_eq!(state.cdb[0].cur_vol, 0x40); // armed only
        state.do_effects(0);
        assert_eq!(state.cdb[0].cur_vol, 0x38);
    }

    #[test]
    fn address_vibrato_swings_the_sample_window() {
        let mut state = PlayerState::new(44100);
        let c = &mut state.cdb[0];
        c.efx_run = 1;
        c.cur_addr = 0x100;
        c.add_begin = 4;
        c.add_begin_time = 2;
        c.add_begin_reset = 2;
        state.do_effects(0);
        assert_eq!(state.cdb[0].cur_addr, 0x104);
        state.do_effects(0);
        assert_eq!(state.cdb[0].cur_addr, 0x108);
        assert_eq!(state.cdb[0].add_begin, -4); // direction reversed
        state.do_effects(0);
        assert_eq!(state.cdb[0].cur_addr, 0x104);
        assert_eq!(state.cdb[0].save_addr, 0x104);
    }
}
