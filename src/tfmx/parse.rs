use std::io;

use arrayvec::ArrayVec;
use log::warn;

use super::{TfmxHeader, TfmxModule, MAX_SUB_SONGS, MAX_TABLE_ENTRIES, TEXT_LINES, TEXT_LINE_LEN};

/// Everything before the word stream.
const HEADER_LEN: usize = 0x200;

/// Recognized file signatures. The short `"TFMX "` prefix covers the early
/// editors that wrote no format suffix.
const MAGICS: [&[u8]; 4] = [b"TFMX-SONG ", b"TFMX_SONG ", b"TFMXSONG ", b"TFMX "];

/// Default table positions used when the header carries zero offsets.
const TRACKSTART_DEFAULT: u32 = 0x180;
const PATTSTART_DEFAULT: u32 = 0x80;
const MACROSTART_DEFAULT: u32 = 0x100;

impl TfmxModule {
    /// Attempts to parse a TFMX music-data file together with its raw
    /// 8-bit signed PCM sample bank.
    ///
    /// Returns an instance of `TfmxModule` on success. A missing signature
    /// or a file shorter than the fixed header is fatal; malformed
    /// start-offset tables merely truncate at the first bad entry.
    pub fn parse(music: &[u8], samples: Vec<u8>) -> io::Result<TfmxModule> {
        if music.len() < HEADER_LEN {
            return Err(invalid_data("file ends inside the TFMX header"));
        }
        if !MAGICS.iter().any(|magic| music.starts_with(magic)) {
            return Err(invalid_data("unrecognized file signature"));
        }

        let mut magic = [0u8; 10];
        magic.copy_from_slice(&music[..10]);

        let mut text = [[0u8; TEXT_LINE_LEN]; TEXT_LINES];
        for (n, line) in text.iter_mut().enumerate() {
            let at = 0x10 + n * TEXT_LINE_LEN;
            line.copy_from_slice(&music[at..at + TEXT_LINE_LEN]);
        }

        let header = TfmxHeader {
            magic,
            text,
            start: read_u16_table(&music[0x100..0x140]),
            end: read_u16_table(&music[0x140..0x180]),
            tempo: read_u16_table(&music[0x180..0x1C0]),
        };

        let nwords = (music.len() - HEADER_LEN) / 4;
        let mut words = Vec::with_capacity(nwords + 1);
        for chunk in music[HEADER_LEN..HEADER_LEN + nwords * 4].chunks_exact(4) {
            words.push(i32::from_be_bytes(chunk.try_into().unwrap()));
        }
        words.push(-1);
        let words = words.into_boxed_slice();

        let trackstart = resolve_start(read_u32(music, 0x1D0), TRACKSTART_DEFAULT, "trackstep");
        let pattstart = resolve_start(read_u32(music, 0x1D4), PATTSTART_DEFAULT, "pattern");
        let macrostart = resolve_start(read_u32(music, 0x1D8), MACROSTART_DEFAULT, "macro");

        let patterns = scan_table(&words, pattstart);
        let macros = scan_table(&words, macrostart);

        let num_tracksteps = match patterns.first() {
            Some(&first) if first > trackstart => (first - trackstart) / 4,
            _ => 0,
        };

        Ok(TfmxModule {
            header,
            words,
            patterns,
            macros,
            trackstart,
            pattstart,
            macrostart,
            num_tracksteps,
            samples: samples.into_boxed_slice(),
        })
    }
}

fn invalid_data(reason: &'static str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, reason)
}

fn read_u16_table(bytes: &[u8]) -> [u16; MAX_SUB_SONGS] {
    let mut table = [0u16; MAX_SUB_SONGS];
    for (value, pair) in table.iter_mut().zip(bytes.chunks_exact(2)) {
        *value = u16::from_be_bytes([pair[0], pair[1]]);
    }
    table
}

fn read_u32(bytes: &[u8], at: usize) -> u32 {
    u32::from_be_bytes(bytes[at..at + 4].try_into().unwrap())
}

/// Converts a file offset into a word index. Offsets must be word-aligned
/// and land past the fixed header.
fn word_index(offset: u32) -> Option<u32> {
    if offset & 3 != 0 {
        return None;
    }
    offset.checked_sub(HEADER_LEN as u32).map(|at| at / 4)
}

fn resolve_start(offset: u32, default: u32, what: &str) -> u32 {
    if offset == 0 {
        return default;
    }
    match word_index(offset) {
        Some(index) => index,
        None => {
            warn!("implausible {} table offset {:#x}, using the default", what, offset);
            default
        }
    }
}

/// Walks a start-offset table, converting file offsets to word indices.
/// The first misaligned or out-of-range entry ends the table.
fn scan_table(words: &[i32], from: u32) -> ArrayVec<u32, MAX_TABLE_ENTRIES> {
    let mut table = ArrayVec::new();
    for slot in 0..MAX_TABLE_ENTRIES as u32 {
        let Some(&entry) = words.get(from.wrapping_add(slot) as usize) else {
            break;
        };
        match word_index(entry as u32) {
            Some(index) if (index as usize) < words.len() => table.push(index),
            _ => break,
        }
    }
    table
}

#[cfg(test)]
mod tests {
    use super::super::TfmxModule;

    fn header_only(magic: &[u8]) -> Vec<u8> {
        let mut music = vec![0u8; 0x200];
        music[..magic.len()].copy_from_slice(magic);
        music
    }

    /// A tiny but structurally complete file: default table layout, one
    /// pattern and one macro.
    fn small_image() -> Vec<u8> {
        let mut music = header_only(b"TFMX-SONG ");
        // one trackstep line, so the pattern data starts one line after
        // the default trackstep table
        let pattern_data = 0x184u32;
        let macro_data = 0x186u32;
        music.resize(0x200 + 0x188 * 4, 0);
        let put = |music: &mut Vec<u8>, index: u32, value: u32| {
            let at = 0x200 + index as usize * 4;
            music[at..at + 4].copy_from_slice(&value.to_be_bytes());
        };
        put(&mut music, 0x80, 0x200 + pattern_data * 4);
        put(&mut music, 0x100, 0x200 + macro_data * 4);
        put(&mut music, pattern_data, 0xF400_0000); // pattern: Stop
        put(&mut music, macro_data, 0x0700_0000); // macro: Stop
        music
    }

    #[test]
    fn parses_bare_header() {
        let music = header_only(b"TFMX-SONG ");
        let module = TfmxModule::parse(&music, vec![0, 0, 0, 0]).unwrap();
        assert_eq!(module.sub_song_count(), 0);
        assert_eq!(module.words.len(), 1); // just the sentinel
        assert!(module.patterns.is_empty());
        assert!(module.macros.is_empty());
        assert_eq!(module.num_tracksteps, 0);
    }

    #[test]
    fn accepts_all_signatures() {
        for magic in [
            b"TFMX-SONG ".as_slice(),
            b"TFMX_SONG ",
            b"TFMXSONG ",
            b"TFMX ",
        ] {
            let music = header_only(magic);
            assert!(TfmxModule::parse(&music, Vec::new()).is_ok());
        }
    }

    #[test]
    fn rejects_wrong_signature() {
        let music = header_only(b"NOT-TFMX  ");
        let err = TfmxModule::parse(&music, Vec::new()).unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::InvalidData);
    }

    #[test]
    fn rejects_truncated_header() {
        let err = TfmxModule::parse(b"TFMX-SONG ", Vec::new()).unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::InvalidData);
    }

    #[test]
    fn zero_offsets_select_defaults() {
        let music = header_only(b"TFMX-SONG ");
        let module = TfmxModule::parse(&music, Vec::new()).unwrap();
        assert_eq!(module.trackstart, 0x180);
        assert_eq!(module.pattstart, 0x80);
        assert_eq!(module.macrostart, 0x100);
    }

    #[test]
    fn explicit_offsets_are_converted() {
        let mut music = header_only(b"TFMX-SONG ");
        music[0x1D0..0x1D4].copy_from_slice(&0x0000_0400u32.to_be_bytes());
        let module = TfmxModule::parse(&music, Vec::new()).unwrap();
        assert_eq!(module.trackstart, (0x400 - 0x200) / 4);
    }

    #[test]
    fn misaligned_start_offset_falls_back() {
        let mut music = header_only(b"TFMX-SONG ");
        music[0x1D0..0x1D4].copy_from_slice(&0x0000_0401u32.to_be_bytes());
        let module = TfmxModule::parse(&music, Vec::new()).unwrap();
        assert_eq!(module.trackstart, 0x180);
    }

    #[test]
    fn tables_parse_and_count_tracksteps() {
        let module = TfmxModule::parse(&small_image(), Vec::new()).unwrap();
        assert_eq!(module.patterns.len(), 1);
        assert_eq!(module.macros.len(), 1);
        assert_eq!(module.patterns[0], 0x184);
        assert_eq!(module.macros[0], 0x186);
        assert_eq!(module.num_tracksteps, 1);
    }

    #[test]
    fn parsing_is_idempotent() {
        let music = small_image();
        let a = TfmxModule::parse(&music, Vec::new()).unwrap();
        let b = TfmxModule::parse(&music, Vec::new()).unwrap();
        assert_eq!(a.words, b.words);
        assert_eq!(a.patterns, b.patterns);
        assert_eq!(a.macros, b.macros);
    }

    #[test]
    fn trailing_garbage_does_not_change_tables() {
        let music = small_image();
        let a = TfmxModule::parse(&music, Vec::new()).unwrap();
        let mut longer = music.clone();
        longer.extend_from_slice(&[0x12, 0x34, 0x56]); // not even a full word
        let b = TfmxModule::parse(&longer, Vec::new()).unwrap();
        assert_eq!(a.patterns, b.patterns);
        assert_eq!(a.macros, b.macros);
    }

    #[test]
    fn sub_song_count_scans_end_positions() {
        let mut music = header_only(b"TFMX-SONG ");
        // end[0] = 4, end[2] = 7
        music[0x140..0x142].copy_from_slice(&4u16.to_be_bytes());
        music[0x144..0x146].copy_from_slice(&7u16.to_be_bytes());
        let module = TfmxModule::parse(&music, Vec::new()).unwrap();
        assert_eq!(module.sub_song_count(), 3);
    }
}
