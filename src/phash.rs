//! Perceptual hash codec.
//!
//! A 64-bit DCT hash: decode, strip alpha, greyscale, resize to 32x32 with
//! bilinear filtering, 2-D DCT, keep the 8x8 low-frequency block (DC
//! included), then threshold each coefficient against the median of the 63
//! non-DC coefficients. Deterministic and independent of the container
//! format; similarity is Hamming distance over the bit string.

use std::fmt;

use image::imageops::FilterType;
use serde::{Deserialize, Serialize};

use crate::error::{MnemoraError, Result};

const HASH_EDGE: usize = 32;
const BLOCK_EDGE: usize = 8;

/// A 64-bit DCT perceptual hash, rendered as 16 lowercase hex chars.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PHash(u64);

impl PHash {
    /// Wraps raw hash bits.
    pub fn from_bits(bits: u64) -> Self {
        Self(bits)
    }

    /// The raw hash bits.
    pub fn bits(self) -> u64 {
        self.0
    }

    /// Parses the 16-char lowercase hex form.
    pub fn from_hex(raw: &str) -> Result<Self> {
        if raw.len() != 16 {
            return Err(MnemoraError::InvalidArgument(format!(
                "phash must be 16 hex chars, got {}",
                raw.len()
            )));
        }
        u64::from_str_radix(raw, 16)
            .map(Self)
            .map_err(|err| MnemoraError::InvalidArgument(format!("phash parse: {err}")))
    }

    /// Renders the canonical 16-char lowercase hex form, MSB first.
    pub fn to_hex(self) -> String {
        format!("{:016x}", self.0)
    }

    /// Hamming distance to another hash: XOR + popcount.
    pub fn hamming(self, other: PHash) -> u32 {
        (self.0 ^ other.0).count_ones()
    }

    /// The duplicate predicate used at capture time.
    pub fn is_duplicate_of(self, last_accepted: Option<PHash>, threshold: u32) -> bool {
        match last_accepted {
            Some(last) => self.hamming(last) <= threshold,
            None => false,
        }
    }

    /// Computes the hash of an encoded image.
    ///
    /// Unreadable input is fatal for the screenshot; the caller rejects it
    /// with reason `decode_failed`.
    pub fn compute(bytes: &[u8]) -> Result<PHash> {
        let decoded = image::load_from_memory(bytes)
            .map_err(|err| MnemoraError::DecodeFailed(err.to_string()))?;
        let grey = decoded.to_luma8();
        let small = image::imageops::resize(
            &grey,
            HASH_EDGE as u32,
            HASH_EDGE as u32,
            FilterType::Triangle,
        );

        let mut pixels = [0.0f64; HASH_EDGE * HASH_EDGE];
        for (i, pixel) in small.pixels().enumerate() {
            pixels[i] = f64::from(pixel.0[0]);
        }
        Ok(Self::from_luma(&pixels))
    }

    /// Hashes a 32x32 greyscale plane. Split out so tests can exercise the
    /// transform without an encoder round trip.
    fn from_luma(pixels: &[f64; HASH_EDGE * HASH_EDGE]) -> PHash {
        let spectrum = dct_2d(pixels);

        // Row-major 8x8 low-frequency block, DC at index 0.
        let mut block = [0.0f64; BLOCK_EDGE * BLOCK_EDGE];
        for row in 0..BLOCK_EDGE {
            for col in 0..BLOCK_EDGE {
                block[row * BLOCK_EDGE + col] = spectrum[row * HASH_EDGE + col];
            }
        }

        let mut ac: Vec<f64> = block[1..].to_vec();
        ac.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        let median = ac[ac.len() / 2];

        let mut bits = 0u64;
        for coeff in &block {
            bits = (bits << 1) | u64::from(*coeff > median);
        }
        PHash(bits)
    }
}

impl fmt::Display for PHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl TryFrom<String> for PHash {
    type Error = MnemoraError;

    fn try_from(value: String) -> Result<Self> {
        PHash::from_hex(&value)
    }
}

impl From<PHash> for String {
    fn from(value: PHash) -> Self {
        value.to_hex()
    }
}

/// Separable 2-D DCT-II over a square plane.
fn dct_2d(pixels: &[f64; HASH_EDGE * HASH_EDGE]) -> [f64; HASH_EDGE * HASH_EDGE] {
    let table = cosine_table();

    // Rows, then columns; 32x32 is small enough that the direct form wins
    // over an FFT-based transform.
    let mut rows = [0.0f64; HASH_EDGE * HASH_EDGE];
    for row in 0..HASH_EDGE {
        for freq in 0..HASH_EDGE {
            let mut sum = 0.0;
            for col in 0..HASH_EDGE {
                sum += pixels[row * HASH_EDGE + col] * table[freq][col];
            }
            rows[row * HASH_EDGE + freq] = sum;
        }
    }

    let mut out = [0.0f64; HASH_EDGE * HASH_EDGE];
    for freq_row in 0..HASH_EDGE {
        for col in 0..HASH_EDGE {
            let mut sum = 0.0;
            for row in 0..HASH_EDGE {
                sum += rows[row * HASH_EDGE + col] * table[freq_row][row];
            }
            out[freq_row * HASH_EDGE + col] = sum;
        }
    }
    out
}

fn cosine_table() -> [[f64; HASH_EDGE]; HASH_EDGE] {
    let n = HASH_EDGE as f64;
    let mut table = [[0.0f64; HASH_EDGE]; HASH_EDGE];
    for (freq, row) in table.iter_mut().enumerate() {
        for (i, cell) in row.iter_mut().enumerate() {
            *cell = (std::f64::consts::PI / n * (i as f64 + 0.5) * freq as f64).cos();
        }
    }
    table
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{ImageBuffer, Luma};
    use proptest::prelude::*;

    fn encode_png(img: &ImageBuffer<Luma<u8>, Vec<u8>>) -> Vec<u8> {
        let mut out = std::io::Cursor::new(Vec::new());
        img.write_to(&mut out, image::ImageFormat::Png).unwrap();
        out.into_inner()
    }

    fn gradient(offset: u8) -> ImageBuffer<Luma<u8>, Vec<u8>> {
        ImageBuffer::from_fn(64, 64, |x, y| {
            Luma([((x * 3 + y * 2) as u8).wrapping_add(offset)])
        })
    }

    #[test]
    fn identical_bytes_hash_identically() {
        let bytes = encode_png(&gradient(0));
        let a = PHash::compute(&bytes).unwrap();
        let b = PHash::compute(&bytes).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.hamming(b), 0);
    }

    #[test]
    fn near_identical_images_are_near_in_hamming() {
        let a = PHash::compute(&encode_png(&gradient(0))).unwrap();
        let b = PHash::compute(&encode_png(&gradient(1))).unwrap();
        assert!(a.hamming(b) <= 8, "distance {}", a.hamming(b));
    }

    #[test]
    fn structurally_different_images_are_far_in_hamming() {
        let grad = PHash::compute(&encode_png(&gradient(0))).unwrap();
        let checker = ImageBuffer::from_fn(64, 64, |x, y| {
            Luma([if (x / 16 + y / 16) % 2 == 0 { 0u8 } else { 255 }])
        });
        let check = PHash::compute(&encode_png(&checker)).unwrap();
        assert!(grad.hamming(check) > 8, "distance {}", grad.hamming(check));
    }

    #[test]
    fn garbage_bytes_fail_decode() {
        let err = PHash::compute(&[0u8; 32]).unwrap_err();
        assert!(matches!(err, MnemoraError::DecodeFailed(_)));
    }

    #[test]
    fn hex_round_trip() {
        let hash = PHash::from_bits(0xdead_beef_0123_4567);
        assert_eq!(hash.to_hex(), "deadbeef01234567");
        assert_eq!(PHash::from_hex("deadbeef01234567").unwrap(), hash);
        assert!(PHash::from_hex("dead").is_err());
    }

    #[test]
    fn duplicate_predicate_requires_prior_hash() {
        let hash = PHash::from_bits(0);
        assert!(!hash.is_duplicate_of(None, 64));
        assert!(hash.is_duplicate_of(Some(PHash::from_bits(1)), 1));
        assert!(!hash.is_duplicate_of(Some(PHash::from_bits(0xff)), 7));
    }

    proptest! {
        #[test]
        fn hamming_is_a_metric(a: u64, b: u64, c: u64) {
            let (a, b, c) = (PHash::from_bits(a), PHash::from_bits(b), PHash::from_bits(c));
            prop_assert_eq!(a.hamming(a), 0);
            prop_assert_eq!(a.hamming(b), b.hamming(a));
            prop_assert!(a.hamming(c) <= a.hamming(b) + b.hamming(c));
        }

        #[test]
        fn hex_form_is_canonical(bits: u64) {
            let hash = PHash::from_bits(bits);
            let hex = hash.to_hex();
            prop_assert_eq!(hex.len(), 16);
            prop_assert!(hex.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
            prop_assert_eq!(PHash::from_hex(&hex).unwrap(), hash);
        }
    }
}
