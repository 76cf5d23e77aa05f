//! TFMX player
use std::path::PathBuf;
use std::sync::mpsc;

use clap::Parser;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use tfmx_file_parser::flags::PlayerQuirks;
use tfmx_file_parser::{TfmxPlayer, TEXT_LINES};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// A file path to the music data (mdat) file.
    mdat: PathBuf,

    /// A file path to the sample bank (smpl) file.
    smpl: PathBuf,

    /// Sub-song number.
    #[arg(short, long, default_value_t = 0)]
    song: usize,

    /// Low-pass filter strength: 0 - 3.
    #[arg(short, long, default_value_t = 0, value_parser = clap::value_parser!(u8).range(0..=3))]
    filter: u8,

    /// Disable the stereo cross-blend.
    #[arg(long)]
    no_blend: bool,

    /// Enable linear interpolation while resampling.
    #[arg(short, long)]
    oversampling: bool,

    /// Loop policy: 0 = play forever, N = N passes, negative = one pass.
    #[arg(short, long, default_value_t = 0, allow_hyphen_values = true)]
    loops: i32,

    /// Log verbosity level.
    #[arg(short, long, action = clap::ArgAction::Count)]
    debug: u8,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    simple_logger::init_with_level(match args.debug {
        0 => log::Level::Warn,
        1 => log::Level::Info,
        2 => log::Level::Debug,
        _ => log::Level::Trace,
    })?;

    let module = tfmx_file_parser::parse_files(&args.mdat, &args.smpl)?;
    log::info!("{}", module);
    for line in 0..TEXT_LINES {
        let text = module.text_line(line);
        if !text.is_empty() {
            log::info!("  {}", text);
        }
    }
    let songs = module.sub_song_count();
    if songs > 0 && args.song >= songs {
        return Err(format!("sub-song {} out of range (0..{})", args.song, songs).into());
    }

    /* create an audio backend */
    let host = cpal::default_host();
    let device = host
        .default_output_device()
        .ok_or("no audio output device")?;
    let config = device.default_output_config()?;
    if config.sample_format() != cpal::SampleFormat::F32 {
        return Err("output device does not offer an f32 stream".into());
    }
    let rate = config.sample_rate().0;
    let channels = config.channels() as usize;
    log::debug!("audio playback: {} Hz, {} ch.", rate, channels);

    let mut player = TfmxPlayer::new(rate);
    let mut quirks = PlayerQuirks::empty();
    if !args.no_blend {
        quirks |= PlayerQuirks::BLEND;
    }
    if args.oversampling {
        quirks |= PlayerQuirks::OVERSAMPLING;
    }
    player.set_quirks(quirks);
    player.set_filter_level(args.filter);
    player.set_loops(args.loops);
    player.load(module);
    player.start_song(args.song, false);

    let (done_tx, done_rx) = mpsc::channel();
    let mut left: Vec<f32> = Vec::new();
    let mut right: Vec<f32> = Vec::new();
    let stream = device.build_output_stream(
        &config.into(),
        move |data: &mut [f32], _| {
            let frames = data.len() / channels;
            left.resize(frames, 0.0);
            right.resize(frames, 0.0);
            player.render(&mut left[..frames], &mut right[..frames]);
            for (chans, n) in data.chunks_mut(channels).zip(0..frames) {
                chans[0] = left[n];
                if channels > 1 {
                    chans[1] = right[n];
                }
            }
            if !player.display_state().active_any {
                let _ = done_tx.send(());
            }
        },
        |err| log::error!("audio stream error: {}", err),
        None,
    )?;
    stream.play()?;

    /* block until the player reaches its stable silent state */
    let _ = done_rx.recv();
    log::info!("finished");
    Ok(())
}
