//! Chunky to planar conversion
//!
//! A chunky raster holds one palette index per byte. A planar raster splits
//! those index bits across `depth` bitplanes; within a plane the most
//! significant bit of each byte is the leftmost pixel.
//!
//! The fast path transposes a 32 pixel x 8 bit block per step with the
//! bit-matrix merge network from Mikael Kalms' public domain c2p collection.

use thiserror::Error;

pub const MAX_DEPTH: u8 = 8;

/// Pixels converted per merge step.
pub const GROUP_PIXELS: usize = 32;

/// Plane slot to transposed word. After the merge network the eight words
/// hold planes 7, 3, 6, 2, 5, 1, 4, 0 in that order.
const PLANE_WORD: [usize; 8] = [7, 5, 3, 1, 6, 4, 2, 0];

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConvertError {
    #[error("depth {0} outside 1..=8")]
    Depth(u8),
    #[error("pixel count {0} is not a multiple of 32")]
    Alignment(usize),
    #[error("{what} buffer holds {actual} bytes, need {expected}")]
    Length {
        what: &'static str,
        expected: usize,
        actual: usize,
    },
}

fn check_depth(depth: u8) -> Result<(), ConvertError> {
    if depth == 0 || depth > MAX_DEPTH {
        return Err(ConvertError::Depth(depth));
    }
    Ok(())
}

fn check_len(what: &'static str, buf: usize, expected: usize) -> Result<(), ConvertError> {
    if buf < expected {
        return Err(ConvertError::Length {
            what,
            expected,
            actual: buf,
        });
    }
    Ok(())
}

/// Geometry of a planar bitmap: rows padded to a 16 pixel boundary, planes
/// stored back to back in plane order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlaneLayout {
    pub width: u16,
    pub height: u16,
    pub depth: u8,
}

impl PlaneLayout {
    pub fn new(width: u16, height: u16, depth: u8) -> Self {
        Self {
            width,
            height,
            depth,
        }
    }

    pub fn bytes_per_row(&self) -> usize {
        usize::from(self.width).div_ceil(16) * 2
    }

    /// Pixels per row including padding.
    pub fn row_pixels(&self) -> usize {
        self.bytes_per_row() * 8
    }

    pub fn plane_len(&self) -> usize {
        self.bytes_per_row() * usize::from(self.height)
    }

    pub fn total_len(&self) -> usize {
        self.plane_len() * usize::from(self.depth)
    }

    pub fn plane<'a>(&self, buf: &'a [u8], plane: usize) -> &'a [u8] {
        let len = self.plane_len();
        &buf[plane * len..(plane + 1) * len]
    }

    /// Converts a chunky image of `row_pixels() * height` indices into this
    /// layout. Images whose pixel count is not a multiple of 32 go through
    /// a padded scratch buffer.
    pub fn convert_chunky(&self, chunky: &[u8], out: &mut [u8]) -> Result<(), ConvertError> {
        check_depth(self.depth)?;
        let pixels = self.row_pixels() * usize::from(self.height);
        check_len("chunky", chunky.len(), pixels)?;
        check_len("planar", out.len(), self.total_len())?;

        if pixels % GROUP_PIXELS == 0 {
            return chunky_to_planar(&chunky[..pixels], out, pixels, self.depth);
        }

        let padded = pixels.next_multiple_of(GROUP_PIXELS);
        let mut src = vec![0u8; padded];
        src[..pixels].copy_from_slice(&chunky[..pixels]);
        let scratch_plane = padded / 8;
        let mut scratch = vec![0u8; scratch_plane * usize::from(self.depth)];
        chunky_to_planar(&src, &mut scratch, padded, self.depth)?;

        let plane_len = self.plane_len();
        for p in 0..usize::from(self.depth) {
            let from = &scratch[p * scratch_plane..p * scratch_plane + plane_len];
            out[p * plane_len..(p + 1) * plane_len].copy_from_slice(from);
        }
        Ok(())
    }
}

#[inline(always)]
fn merge(d: &mut [u32; 8], a: usize, b: usize, shift: u32, mask: u32) {
    let t = ((d[b] >> shift) ^ d[a]) & mask;
    d[a] ^= t;
    d[b] ^= t << shift;
}

/// Converts `pixels` chunky indices into `depth` planes of `pixels / 8`
/// bytes each. Bit `p` of pixel `i` lands in plane `p`, bit `7 - i % 8` of
/// byte `i / 8`.
pub fn chunky_to_planar(input: &[u8], output: &mut [u8], pixels: usize, depth: u8) -> Result<(), ConvertError> {
    check_depth(depth)?;
    if pixels % GROUP_PIXELS != 0 {
        return Err(ConvertError::Alignment(pixels));
    }
    let plane_len = pixels / 8;
    check_len("chunky", input.len(), pixels)?;
    check_len("planar", output.len(), plane_len * usize::from(depth))?;

    for (r, group) in input[..pixels].chunks_exact(GROUP_PIXELS).enumerate() {
        let mut d = [0u32; 8];
        for (word, b) in d.iter_mut().zip(group.chunks_exact(4)) {
            *word = u32::from_be_bytes([b[0], b[1], b[2], b[3]]);
        }

        merge(&mut d, 0, 1, 4, 0x0f0f_0f0f);
        merge(&mut d, 2, 3, 4, 0x0f0f_0f0f);
        merge(&mut d, 4, 5, 4, 0x0f0f_0f0f);
        merge(&mut d, 6, 7, 4, 0x0f0f_0f0f);

        merge(&mut d, 0, 4, 16, 0x0000_ffff);
        merge(&mut d, 1, 5, 16, 0x0000_ffff);
        merge(&mut d, 2, 6, 16, 0x0000_ffff);
        merge(&mut d, 3, 7, 16, 0x0000_ffff);

        merge(&mut d, 0, 4, 2, 0x3333_3333);
        merge(&mut d, 1, 5, 2, 0x3333_3333);
        merge(&mut d, 2, 6, 2, 0x3333_3333);
        merge(&mut d, 3, 7, 2, 0x3333_3333);

        merge(&mut d, 0, 2, 8, 0x00ff_00ff);
        merge(&mut d, 1, 3, 8, 0x00ff_00ff);
        merge(&mut d, 4, 6, 8, 0x00ff_00ff);
        merge(&mut d, 5, 7, 8, 0x00ff_00ff);

        merge(&mut d, 0, 2, 1, 0x5555_5555);
        merge(&mut d, 1, 3, 1, 0x5555_5555);
        merge(&mut d, 4, 6, 1, 0x5555_5555);
        merge(&mut d, 5, 7, 1, 0x5555_5555);

        for (plane, &word) in PLANE_WORD[..usize::from(depth)].iter().enumerate() {
            let at = plane * plane_len + r * 4;
            output[at..at + 4].copy_from_slice(&d[word].to_be_bytes());
        }
    }

    Ok(())
}

/// Reduces 4-byte truecolor pixels (alpha ignored) to 16 gray levels.
pub fn truecolor_to_chunky(input: &[u8], output: &mut [u8]) -> Result<(), ConvertError> {
    let pixels = input.len() / 4;
    check_len("chunky", output.len(), pixels)?;

    for (px, out) in input.chunks_exact(4).zip(output.iter_mut()) {
        let sum = u32::from(px[0]) + u32::from(px[1]) + u32::from(px[2]);
        // at most 255 >> 4
        *out = ((sum / 3) >> 4) as u8;
    }
    Ok(())
}

pub fn truecolor_to_planar(input: &[u8], output: &mut [u8], pixels: usize, depth: u8) -> Result<(), ConvertError> {
    check_len("truecolor", input.len(), pixels * 4)?;
    let mut indexed = vec![0u8; pixels];
    truecolor_to_chunky(&input[..pixels * 4], &mut indexed)?;
    chunky_to_planar(&indexed, output, pixels, depth)
}

/// Gathers the planes of `bitmap` back into one index per visible pixel,
/// dropping row padding. `output` receives `width * height` bytes.
pub fn planar_to_chunky(bitmap: &[u8], layout: &PlaneLayout, output: &mut [u8]) -> Result<(), ConvertError> {
    check_depth(layout.depth)?;
    check_len("planar", bitmap.len(), layout.total_len())?;
    let width = usize::from(layout.width);
    let height = usize::from(layout.height);
    check_len("chunky", output.len(), width * height)?;

    let bpr = layout.bytes_per_row();
    output[..width * height].fill(0);
    for p in 0..usize::from(layout.depth) {
        let plane = layout.plane(bitmap, p);
        for y in 0..height {
            let row = &plane[y * bpr..(y + 1) * bpr];
            let dst = &mut output[y * width..(y + 1) * width];
            for (x, px) in dst.iter_mut().enumerate() {
                let bit = (row[x / 8] >> (7 - x % 8)) & 1;
                *px |= bit << p;
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn reference(input: &[u8], pixels: usize, depth: u8) -> Vec<u8> {
        let plane_len = pixels / 8;
        let mut out = vec![0u8; plane_len * usize::from(depth)];
        for p in 0..usize::from(depth) {
            for (i, &px) in input.iter().enumerate() {
                if px >> p & 1 == 1 {
                    out[p * plane_len + i / 8] |= 0x80 >> (i % 8);
                }
            }
        }
        out
    }

    #[test]
    fn alternating_pixels_fill_plane_zero() {
        let input: Vec<u8> = (0..32).map(|i| if i % 2 == 0 { 1 } else { 0 }).collect();
        let mut out = [0u8; 4];
        chunky_to_planar(&input, &mut out, 32, 1).unwrap();
        assert_eq!(u32::from_be_bytes(out), 0xAAAA_AAAA);
    }

    #[test]
    fn every_plane_slot_is_written() {
        // pixel i carries index i, so plane p has bit p of 0..32 spread across it
        let input: Vec<u8> = (0..32).collect();
        let mut out = vec![0u8; 4 * 8];
        chunky_to_planar(&input, &mut out, 32, 8).unwrap();
        assert_eq!(out, reference(&input, 32, 8));
        assert_eq!(u32::from_be_bytes([out[0], out[1], out[2], out[3]]), 0x5555_5555);
        assert_eq!(u32::from_be_bytes([out[16], out[17], out[18], out[19]]), 0x0000_FFFF);
        assert!(out[20..].iter().all(|&b| b == 0));
    }

    #[test]
    fn shallow_depth_leaves_trailing_output_untouched() {
        let input = [0xffu8; 32];
        let mut out = [0x11u8; 12];
        chunky_to_planar(&input, &mut out, 32, 2).unwrap();
        assert_eq!(&out[..8], &[0xff; 8]);
        assert_eq!(&out[8..], &[0x11; 4]);
    }

    #[test]
    fn rejects_bad_arguments() {
        let mut out = [0u8; 64];
        assert_eq!(chunky_to_planar(&[0; 32], &mut out, 32, 0), Err(ConvertError::Depth(0)));
        assert_eq!(chunky_to_planar(&[0; 32], &mut out, 32, 9), Err(ConvertError::Depth(9)));
        assert_eq!(chunky_to_planar(&[0; 40], &mut out, 40, 1), Err(ConvertError::Alignment(40)));
        assert!(matches!(
            chunky_to_planar(&[0; 16], &mut out, 32, 1),
            Err(ConvertError::Length { what: "chunky", .. })
        ));
        assert!(matches!(
            chunky_to_planar(&[0; 64], &mut out[..4], 64, 1),
            Err(ConvertError::Length { what: "planar", .. })
        ));
    }

    #[test]
    fn truecolor_reduces_to_sixteen_grays() {
        let input = [255, 255, 255, 0, 0, 0, 0, 255, 48, 48, 48, 7, 255, 0, 0, 0];
        let mut out = [0u8; 4];
        truecolor_to_chunky(&input, &mut out).unwrap();
        assert_eq!(out, [15, 0, 3, 5]);
    }

    #[test]
    fn truecolor_to_planar_white_sets_low_four_planes() {
        let input = [255u8; 32 * 4];
        let mut out = [0u8; 4 * 5];
        truecolor_to_planar(&input, &mut out, 32, 5).unwrap();
        assert_eq!(&out[..16], &[0xff; 16]);
        assert_eq!(&out[16..], &[0; 4]);
    }

    #[test]
    fn layout_pads_rows_to_sixteen_pixels() {
        let layout = PlaneLayout::new(20, 3, 3);
        assert_eq!(layout.bytes_per_row(), 4);
        assert_eq!(layout.row_pixels(), 32);
        assert_eq!(layout.plane_len(), 12);
        assert_eq!(layout.total_len(), 36);
        assert_eq!(PlaneLayout::new(16, 1, 1).bytes_per_row(), 2);
        assert_eq!(PlaneLayout::new(1, 1, 1).bytes_per_row(), 2);
    }

    #[test]
    fn padded_layout_survives_display_decode() {
        // 3 rows of 16 px is 48 px, off the 32 px grid
        let layout = PlaneLayout::new(16, 3, 4);
        assert_eq!((layout.row_pixels() * 3) % GROUP_PIXELS, 16);

        let chunky: Vec<u8> = (0..48u8).map(|i| i % 16).collect();
        let mut planar = vec![0u8; layout.total_len()];
        layout.convert_chunky(&chunky, &mut planar).unwrap();

        let mut back = vec![0u8; 48];
        planar_to_chunky(&planar, &layout, &mut back).unwrap();
        assert_eq!(back, chunky);
    }

    proptest! {
        #[test]
        fn matches_bitwise_reference(
            groups in 1usize..5,
            depth in 1u8..=8,
            seed in proptest::collection::vec(any::<u8>(), 128),
        ) {
            let pixels = groups * GROUP_PIXELS;
            let input = &seed[..pixels];
            let mut out = vec![0u8; pixels / 8 * usize::from(depth)];
            chunky_to_planar(input, &mut out, pixels, depth).unwrap();
            prop_assert_eq!(out, reference(input, pixels, depth));
        }
    }
}
