//! LZKN64, the LZ77-style scheme Konami used for the compressed files of its
//! N64 titles.
//!
//! A stream starts with a 4-byte header (byte 0 reserved, bytes 1-3 the
//! big-endian size of the stream including the header) followed by commands:
//!
//! | command       | meaning                                                     |
//! |---------------|-------------------------------------------------------------|
//! | `0x00..=0x7F` | window copy, length `(cmd >> 2) + 2`, 10-bit distance        |
//! | `0x80..=0xBF` | raw copy of `cmd & 0x1F` literal bytes                       |
//! | `0xC0..=0xDF` | run of `(cmd & 0x1F) + 2` copies of the following byte       |
//! | `0xE0..=0xFE` | run of `(cmd & 0x1F) + 2` zero bytes                         |
//! | `0xFF`        | run of `next + 2` zero bytes                                 |
//!
//! The encoder reproduces the match selection of the vanilla tool, so output
//! for unmodified data lines up with what ships on the cartridge.

const MODE_WINDOW_COPY: u8 = 0x00;
const MODE_RAW_COPY: u8 = 0x80;
const MODE_RLE_WRITE_A: u8 = 0xC0;
const MODE_RLE_WRITE_B: u8 = 0xE0;
const MODE_RLE_WRITE_C: u8 = 0xFF;

/// How far back the encoder looks for a window match.
const WINDOW_SIZE: usize = 0x3DF;
/// Longest window copy (and one more than the longest non-zero run).
const COPY_SIZE: usize = 0x21;
/// Longest zero run the extended RLE command can express.
const RLE_SIZE: usize = 0x101;
/// Longest raw copy a single command can carry.
const RAW_COPY_SIZE: usize = 0x1F;

pub const HEADER_SIZE: usize = 4;

/// Decompressed output is always padded out to this alignment.
const OUTPUT_ALIGNMENT: usize = 0x10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    None,
    WindowCopy { length: usize, distance: usize },
    Rle { value: u8, length: usize },
}

/// Longest earlier occurrence of the bytes at `pos`, returned as
/// `(length, distance)`. Among equally long matches the one closest to `pos`
/// wins.
fn find_window_match(input: &[u8], pos: usize) -> (usize, usize) {
    let max_length = COPY_SIZE.min(input.len() - pos);
    let window_start = pos.saturating_sub(WINDOW_SIZE);
    let target = &input[pos..pos + max_length];

    let mut best_length = 0usize;
    let mut best_start = pos;

    // Walk from the nearest candidate outwards so that only a strictly longer
    // match can displace an earlier pick.
    for start in (window_start..pos).rev() {
        let length = input[start..]
            .iter()
            .zip(target)
            .take_while(|(a, b)| a == b)
            .count();

        if length > best_length {
            best_length = length;
            best_start = start;
            if best_length == max_length {
                break;
            }
        }
    }

    (best_length, pos - best_start)
}

/// Number of bytes starting at `pos` equal to `input[pos]`, returned as
/// `(value, length)`.
fn find_forward_run(input: &[u8], pos: usize) -> (u8, usize) {
    let value = input[pos];

    let mut max_length = RLE_SIZE.min(input.len() - pos);
    // The explicit-value RLE command only has a 5-bit length field.
    if value != 0 {
        max_length = max_length.min(COPY_SIZE - 1);
    }

    let length = input[pos..pos + max_length]
        .iter()
        .take_while(|&&b| b == value)
        .count();

    (value, length)
}

fn select_mode(window: (usize, usize), run: (u8, usize)) -> Mode {
    let (window_length, distance) = window;
    let (value, run_length) = run;

    if window_length >= 4 && window_length > run_length {
        Mode::WindowCopy {
            length: window_length,
            distance,
        }
    } else if run_length >= 3 || (run_length == 2 && value == 0) {
        Mode::Rle {
            value,
            length: run_length,
        }
    } else {
        Mode::None
    }
}

fn write_raw_copies(out: &mut Vec<u8>, literals: &[u8]) {
    for chunk in literals.chunks(RAW_COPY_SIZE) {
        out.push(MODE_RAW_COPY | chunk.len() as u8);
        out.extend_from_slice(chunk);
    }
}

fn write_mode(out: &mut Vec<u8>, mode: Mode) {
    match mode {
        Mode::None => {}
        Mode::WindowCopy { length, distance } => {
            out.push(
                MODE_WINDOW_COPY
                    | ((((length - 2) & 0x1F) << 2) as u8)
                    | (((distance & 0x300) >> 8) as u8),
            );
            out.push((distance & 0xFF) as u8);
        }
        Mode::Rle { value, length } => {
            if value != 0 {
                out.push(MODE_RLE_WRITE_A | ((length - 2) & 0x1F) as u8);
                out.push(value);
            } else if length < COPY_SIZE {
                out.push(MODE_RLE_WRITE_B | ((length - 2) & 0x1F) as u8);
            } else {
                out.push(MODE_RLE_WRITE_C);
                out.push(((length - 2) & 0xFF) as u8);
            }
        }
    }
}

/// Compresses `input` into an LZKN64 stream.
///
/// The result carries the 4-byte header and is padded with a single zero
/// byte when its natural length is odd. The pad byte is not counted in the
/// header's size field.
pub fn compress(input: &[u8]) -> Vec<u8> {
    let mut out = vec![0u8; HEADER_SIZE];

    let mut pos = 0usize;
    // Start of the literals not yet written out as raw copies.
    let mut last_copy = 0usize;

    while pos < input.len() {
        let mode = select_mode(find_window_match(input, pos), find_forward_run(input, pos));

        let pending = pos - last_copy;
        let at_last_byte = pos + 1 == input.len();

        if (mode != Mode::None && pending >= 1) || pending >= RAW_COPY_SIZE || at_last_byte {
            let end = if at_last_byte { input.len() } else { pos };
            write_raw_copies(&mut out, &input[last_copy..end]);
            last_copy = end;
        }

        write_mode(&mut out, mode);

        match mode {
            Mode::WindowCopy { length, .. } | Mode::Rle { length, .. } => {
                pos += length;
                last_copy = pos;
            }
            Mode::None => pos += 1,
        }
    }

    let size = out.len();
    out[1] = ((size >> 16) & 0xFF) as u8;
    out[2] = ((size >> 8) & 0xFF) as u8;
    out[3] = (size & 0xFF) as u8;

    if out.len() % 2 != 0 {
        out.push(0x00);
    }

    out
}

/// Size recorded in an LZKN64 header, or `None` if `input` is too short to
/// hold one.
pub fn declared_size(input: &[u8]) -> Option<usize> {
    if input.len() < HEADER_SIZE {
        return None;
    }
    Some(((input[1] as usize) << 16) | ((input[2] as usize) << 8) | input[3] as usize)
}

/// Decompresses an LZKN64 stream.
///
/// There is no integrity check in the format: corrupt input decodes to
/// garbage instead of failing. Bytes the stream refers to but does not
/// contain read as zero. The output is zero-padded to a multiple of 16.
pub fn decompress(input: &[u8]) -> Vec<u8> {
    let mut out: Vec<u8> = Vec::new();

    let end = declared_size(input).unwrap_or(0).min(input.len());
    let byte_at = |i: usize| input.get(i).copied().unwrap_or(0);

    let mut pos = HEADER_SIZE;
    while pos < end {
        let command = input[pos];
        pos += 1;

        match command {
            0x00..=0x7F => {
                let length = (command as usize >> 2) + 2;
                let distance = (((command as usize) << 8) | byte_at(pos) as usize) & 0x3FF;
                pos += 1;

                // Byte by byte: the copy may overlap the bytes it produces.
                for _ in 0..length {
                    let value = match out.len().checked_sub(distance) {
                        Some(src) if distance > 0 => out[src],
                        _ => 0,
                    };
                    out.push(value);
                }
            }
            0x80..=0xBF => {
                let length = (command & 0x1F) as usize;
                for _ in 0..length {
                    out.push(byte_at(pos));
                    pos += 1;
                }
            }
            0xC0..=0xDF => {
                let length = (command & 0x1F) as usize + 2;
                let value = byte_at(pos);
                pos += 1;
                out.resize(out.len() + length, value);
            }
            0xE0..=0xFE => {
                let length = (command & 0x1F) as usize + 2;
                out.resize(out.len() + length, 0);
            }
            0xFF => {
                let length = byte_at(pos) as usize + 2;
                pos += 1;
                out.resize(out.len() + length, 0);
            }
        }
    }

    let padded = out.len().next_multiple_of(OUTPUT_ALIGNMENT);
    out.resize(padded, 0);
    out
}

#[cfg(test)]
mod tests {
    use super::{compress, declared_size, decompress, HEADER_SIZE};
    use proptest::prelude::*;

    fn padded(data: &[u8]) -> Vec<u8> {
        let mut v = data.to_vec();
        v.resize(data.len().next_multiple_of(16), 0);
        v
    }

    /// Splits a stream into its commands, returning the command bytes only.
    fn commands(stream: &[u8]) -> Vec<u8> {
        let end = declared_size(stream).unwrap();
        let mut pos = HEADER_SIZE;
        let mut cmds = Vec::new();
        while pos < end {
            let cmd = stream[pos];
            cmds.push(cmd);
            pos += 1;
            pos += match cmd {
                0x00..=0x7F => 1,
                0x80..=0xBF => (cmd & 0x1F) as usize,
                0xC0..=0xDF => 1,
                0xE0..=0xFE => 0,
                0xFF => 1,
            };
        }
        assert_eq!(pos, end);
        cmds
    }

    #[test]
    fn empty_input() {
        let packed = compress(&[]);
        assert_eq!(packed, vec![0x00, 0x00, 0x00, 0x04]);
        assert!(decompress(&packed).is_empty());
    }

    #[test]
    fn zero_run_uses_valueless_rle() {
        let data = [0u8; 20];
        let packed = compress(&data);
        // Header, one 0xE0 | (20 - 2) command, pad byte.
        assert_eq!(packed, vec![0x00, 0x00, 0x00, 0x05, 0xF2, 0x00]);

        let unpacked = decompress(&packed);
        assert_eq!(unpacked.len(), 32);
        assert!(unpacked.iter().all(|&b| b == 0));
    }

    #[test]
    fn long_zero_run_uses_extended_rle() {
        let data = [0u8; 100];
        let packed = compress(&data);
        assert_eq!(packed, vec![0x00, 0x00, 0x00, 0x06, 0xFF, 98]);
        assert_eq!(decompress(&packed), padded(&data));
    }

    #[test]
    fn zero_run_switches_to_extended_rle_past_32() {
        assert_eq!(commands(&compress(&[0u8; 32])), vec![0xFE]);
        assert_eq!(&compress(&[0u8; 33])[4..6], &[0xFF, 0x1F]);
    }

    #[test]
    fn zero_run_is_capped_at_257() {
        let cases: [(usize, &[u8]); 3] = [
            (257, &[0xFF, 0xFF]),
            (258, &[0xFF, 0xFF, 0x81, 0x00]),
            (259, &[0xFF, 0xFF, 0xE0]),
        ];
        for (n, expected) in cases {
            let data = vec![0u8; n];
            let packed = compress(&data);
            let end = declared_size(&packed).unwrap();
            assert_eq!(&packed[HEADER_SIZE..end], expected, "length {n}");
            assert_eq!(decompress(&packed), padded(&data), "length {n}");
        }
    }

    fn far_match(gap: usize) -> Vec<u8> {
        let pattern: Vec<u8> = (0x51..=0x58).collect();
        let mut data = pattern.clone();
        data.resize(gap, 0);
        data.extend_from_slice(&pattern);
        data
    }

    #[test]
    fn match_at_window_edge_is_copied() {
        let data = far_match(991);
        let packed = compress(&data);
        let end = declared_size(&packed).unwrap();
        // Length 8 at distance 0x3DF.
        assert_eq!(&packed[end - 2..end], &[(6 << 2) | 0x03, 0xDF]);
        assert_eq!(decompress(&packed), padded(&data));
    }

    #[test]
    fn match_past_window_stays_raw() {
        let data = far_match(992);
        let packed = compress(&data);
        let end = declared_size(&packed).unwrap();
        let mut tail = vec![0x88u8];
        tail.extend(0x51..=0x58u8);
        assert_eq!(&packed[end - 9..end], tail.as_slice());
        assert_eq!(decompress(&packed), padded(&data));
    }

    #[test]
    fn zero_run_of_two_is_encoded() {
        let data = [0x11, 0x00, 0x00, 0x22];
        let packed = compress(&data);
        assert_eq!(commands(&packed), vec![0x81, 0xE0, 0x81]);
        assert_eq!(decompress(&packed), padded(&data));
    }

    #[test]
    fn nonzero_run_is_capped_at_32() {
        let data = [0x41u8; 40];
        let packed = compress(&data);
        // A 32-byte run, then an 8-byte run: the equally long window match
        // does not beat the run.
        assert_eq!(&packed[4..6], &[0xC0 | 30, 0x41]);
        assert_eq!(commands(&packed), vec![0xDE, 0xC6]);
        assert_eq!(decompress(&packed), padded(&data));
    }

    #[test]
    fn three_byte_match_stays_raw() {
        let packed = compress(b"ABCABC");
        assert_eq!(
            packed,
            vec![0x00, 0x00, 0x00, 0x0B, 0x86, b'A', b'B', b'C', b'A', b'B', b'C', 0x00]
        );
        assert_eq!(decompress(&packed), padded(b"ABCABC"));
    }

    #[test]
    fn four_byte_match_uses_window_copy() {
        let packed = compress(b"ABCDABCD");
        assert_eq!(
            packed,
            vec![0x00, 0x00, 0x00, 0x0B, 0x84, b'A', b'B', b'C', b'D', 0x08, 0x04, 0x00]
        );
        assert_eq!(decompress(&packed), padded(b"ABCDABCD"));
    }

    #[test]
    fn equal_matches_prefer_the_closest() {
        // "WXYZ" occurs at 0 and at 5; the copy at 10 must reference 5.
        let data = b"WXYZ1WXYZ2WXYZ";
        let packed = compress(data);
        let end = declared_size(&packed).unwrap();
        assert_eq!(&packed[end - 2..end], &[0x08, 0x05]);
        assert_eq!(&decompress(&packed)[..data.len()], data);
    }

    #[test]
    fn raw_copies_are_chunked_by_31() {
        let data: Vec<u8> = (1..=40).collect();
        let packed = compress(&data);
        assert_eq!(commands(&packed), vec![0x9F, 0x89]);
        assert_eq!(packed.len(), 4 + 32 + 10);

        let unpacked = decompress(&packed);
        assert_eq!(unpacked.len(), 48);
        assert_eq!(unpacked, padded(&data));
    }

    #[test]
    fn raw_chunk_counts() {
        for n in [31usize, 32, 62, 63, 93, 100] {
            let data: Vec<u8> = (1..=n as u8).collect();
            let cmds = commands(&compress(&data));
            assert_eq!(cmds.len(), n.div_ceil(31), "length {n}");
            for cmd in &cmds[..cmds.len() - 1] {
                assert_eq!(*cmd, 0x9F);
            }
        }
    }

    #[test]
    fn overlapping_window_copy_decodes() {
        // Raw "AB", then copy 6 bytes from distance 2.
        let stream = [0x00, 0x00, 0x00, 0x09, 0x82, b'A', b'B', 4 << 2, 0x02];
        let out = decompress(&stream);
        assert_eq!(&out[..8], b"ABABABAB");
        assert_eq!(out.len(), 16);
    }

    #[test]
    fn truncated_stream_does_not_panic() {
        assert!(decompress(&[0x00, 0x01]).is_empty());
        // Declared size past the end, raw copy running off the input and a
        // window copy reaching before the output start.
        let out = decompress(&[0x00, 0xFF, 0xFF, 0xFF, 0x05, 0x10, 0x85, 0x01]);
        assert_eq!(out.len(), 16);
        assert_eq!(&out[..8], &[0, 0, 0, 0x01, 0, 0, 0, 0]);
    }

    proptest! {
        #[test]
        fn round_trip(data in proptest::collection::vec(any::<u8>(), 0..2048)) {
            prop_assert_eq!(decompress(&compress(&data)), padded(&data));
        }

        #[test]
        fn round_trip_low_entropy(data in proptest::collection::vec(0u8..3, 0..2048)) {
            prop_assert_eq!(decompress(&compress(&data)), padded(&data));
        }

        #[test]
        fn deterministic(data in proptest::collection::vec(0u8..8, 0..512)) {
            prop_assert_eq!(compress(&data), compress(&data));
            let packed = compress(&data);
            prop_assert_eq!(decompress(&packed), decompress(&packed));
        }

        #[test]
        fn header_and_padding(data in proptest::collection::vec(0u8..4, 0..1024)) {
            let packed = compress(&data);
            let size = declared_size(&packed).unwrap();
            prop_assert_eq!(packed.len() % 2, 0);
            prop_assert!(packed.len() == size || packed.len() == size + 1);
            if packed.len() == size + 1 {
                prop_assert_eq!(packed[size], 0);
            }
        }

        #[test]
        fn window_copies_stay_in_bounds(data in proptest::collection::vec(0u8..4, 1..1024)) {
            let packed = compress(&data);
            let end = declared_size(&packed).unwrap();
            let mut pos = HEADER_SIZE;
            let mut written = 0usize;
            while pos < end {
                let cmd = packed[pos];
                match cmd {
                    0x00..=0x7F => {
                        let distance = (((cmd as usize) << 8) | packed[pos + 1] as usize) & 0x3FF;
                        prop_assert!(distance >= 1 && distance <= written);
                        written += (cmd as usize >> 2) + 2;
                        pos += 2;
                    }
                    0x80..=0xBF => {
                        written += (cmd & 0x1F) as usize;
                        pos += 1 + (cmd & 0x1F) as usize;
                    }
                    0xC0..=0xDF => {
                        written += (cmd & 0x1F) as usize + 2;
                        pos += 2;
                    }
                    0xE0..=0xFE => {
                        written += (cmd & 0x1F) as usize + 2;
                        pos += 1;
                    }
                    0xFF => {
                        written += packed[pos + 1] as usize + 2;
                        pos += 2;
                    }
                }
            }
            prop_assert_eq!(written, data.len());
        }
    }
}
