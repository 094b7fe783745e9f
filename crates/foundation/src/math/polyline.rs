//! Encoded polyline codec (the Google "encoded polyline algorithm format").
//!
//! Route geometry arrives from the store as an encoded string with latitude
//! first in each pair. Decoding happens once per trip off the render thread.

use std::fmt;

use super::LngLat;

/// Precision used by the trip store (5 decimal places).
pub const POLYLINE_PRECISION: u32 = 5;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PolylineError {
    /// Input ended in the middle of a varint.
    Truncated { offset: usize },
    /// Byte outside the encoding alphabet (`?`..`~`).
    InvalidByte { offset: usize, byte: u8 },
    /// Varint longer than any 64-bit value.
    Overflow { offset: usize },
}

impl fmt::Display for PolylineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PolylineError::Truncated { offset } => {
                write!(f, "polyline truncated at byte {offset}")
            }
            PolylineError::InvalidByte { offset, byte } => {
                write!(f, "invalid polyline byte 0x{byte:02x} at {offset}")
            }
            PolylineError::Overflow { offset } => {
                write!(f, "polyline value overflows at byte {offset}")
            }
        }
    }
}

impl std::error::Error for PolylineError {}

pub fn decode_polyline(encoded: &str, precision: u32) -> Result<Vec<LngLat>, PolylineError> {
    let factor = 10f64.powi(precision as i32);
    let bytes = encoded.as_bytes();
    let mut points = Vec::with_capacity(bytes.len() / 4);

    let mut offset = 0usize;
    let mut lat = 0i64;
    let mut lng = 0i64;
    while offset < bytes.len() {
        lat = accumulate(lat, bytes, &mut offset)?;
        lng = accumulate(lng, bytes, &mut offset)?;
        points.push(LngLat::new(lng as f64 / factor, lat as f64 / factor));
    }

    Ok(points)
}

/// Add the next delta to a running coordinate. Deltas that push it past
/// `i64` are reported at the offset where the delta starts.
fn accumulate(current: i64, bytes: &[u8], offset: &mut usize) -> Result<i64, PolylineError> {
    let start = *offset;
    let delta = next_value(bytes, offset)?;
    current
        .checked_add(delta)
        .ok_or(PolylineError::Overflow { offset: start })
}

fn next_value(bytes: &[u8], offset: &mut usize) -> Result<i64, PolylineError> {
    let mut result: i64 = 0;
    let mut shift = 0u32;
    loop {
        let Some(&byte) = bytes.get(*offset) else {
            return Err(PolylineError::Truncated { offset: *offset });
        };
        if !(63..=126).contains(&byte) {
            return Err(PolylineError::InvalidByte {
                offset: *offset,
                byte,
            });
        }
        if shift > 60 {
            return Err(PolylineError::Overflow { offset: *offset });
        }
        *offset += 1;

        let chunk = (byte - 63) as i64;
        result |= (chunk & 0x1f) << shift;
        shift += 5;
        if chunk < 0x20 {
            break;
        }
    }

    Ok(if result & 1 == 1 {
        !(result >> 1)
    } else {
        result >> 1
    })
}

pub fn encode_polyline(points: &[LngLat], precision: u32) -> String {
    let factor = 10f64.powi(precision as i32);
    let mut out = String::with_capacity(points.len() * 8);

    let mut prev_lat = 0i64;
    let mut prev_lng = 0i64;
    for p in points {
        let lat = (p.lat * factor).round() as i64;
        let lng = (p.lng * factor).round() as i64;
        push_value(&mut out, lat.saturating_sub(prev_lat));
        push_value(&mut out, lng.saturating_sub(prev_lng));
        prev_lat = lat;
        prev_lng = lng;
    }

    out
}

fn push_value(out: &mut String, delta: i64) {
    let mut v = ((delta << 1) ^ (delta >> 63)) as u64;
    while v >= 0x20 {
        out.push((((v & 0x1f) | 0x20) as u8 + 63) as char);
        v >>= 5;
    }
    out.push((v as u8 + 63) as char);
}

#[cfg(test)]
mod tests {
    use super::{POLYLINE_PRECISION, PolylineError, decode_polyline, encode_polyline};
    use crate::math::LngLat;

    const REFERENCE: &str = "_p~iF~ps|U_ulLnnqC_mqNvxq`@";

    fn assert_close(a: f64, b: f64) {
        assert!((a - b).abs() < 1e-9, "expected {a} ~= {b}");
    }

    #[test]
    fn decodes_reference_polyline() {
        let pts = decode_polyline(REFERENCE, POLYLINE_PRECISION).unwrap();
        assert_eq!(pts.len(), 3);
        assert_close(pts[0].lat, 38.5);
        assert_close(pts[0].lng, -120.2);
        assert_close(pts[1].lat, 40.7);
        assert_close(pts[1].lng, -120.95);
        assert_close(pts[2].lat, 43.252);
        assert_close(pts[2].lng, -126.453);
    }

    #[test]
    fn encodes_reference_polyline() {
        let pts = [
            LngLat::new(-120.2, 38.5),
            LngLat::new(-120.95, 40.7),
            LngLat::new(-126.453, 43.252),
        ];
        assert_eq!(encode_polyline(&pts, POLYLINE_PRECISION), REFERENCE);
    }

    #[test]
    fn empty_input_is_empty_path() {
        assert_eq!(decode_polyline("", POLYLINE_PRECISION).unwrap(), vec![]);
    }

    #[test]
    fn rejects_truncated_and_invalid_input() {
        // Continuation bit set on the final byte.
        assert!(matches!(
            decode_polyline("_p~iF~ps|", POLYLINE_PRECISION),
            Err(PolylineError::Truncated { .. })
        ));
        assert!(matches!(
            decode_polyline("_p~iF ps|U", POLYLINE_PRECISION),
            Err(PolylineError::InvalidByte { byte: b' ', .. })
        ));
    }

    #[test]
    fn running_sum_overflow_is_an_error() {
        // Each pair carries a latitude delta near i64::MAX / 2.
        let hostile = "}~~~~~~~~~~~F?".repeat(3);
        assert_eq!(
            decode_polyline(&hostile, POLYLINE_PRECISION),
            Err(PolylineError::Overflow { offset: 28 })
        );
    }

    #[test]
    fn overlong_varint_is_an_error() {
        let hostile = format!("{}?", "~".repeat(20));
        assert!(matches!(
            decode_polyline(&hostile, POLYLINE_PRECISION),
            Err(PolylineError::Overflow { .. })
        ));
    }
}
