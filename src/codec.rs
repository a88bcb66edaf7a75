//! Chunk payload codecs.
//!
//! Two encodings arrive over the wire, both as base64 strings:
//!
//! | Encoding          | Shape                 | Bytes per cell | Cell order            |
//! |-------------------|-----------------------|----------------|-----------------------|
//! | `PAL16_Y8`        | 16×16 surface         | 3 (u16 LE + y) | `z*16 + x`            |
//! | `PAL16_U16LE_YZX` | 16×16×height volume   | 2 (u16 LE)     | `x + z*16 + y*16*16`  |
//!
//! Every function here is pure. A payload is accepted whole or rejected
//! whole; a short or long buffer never yields a partial array.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;

use crate::error::CodecError;
use crate::types::CHUNK_AREA;

pub const SURFACE_ENCODING: &str = "PAL16_Y8";
pub const VOXEL_ENCODING: &str = "PAL16_U16LE_YZX";

/// Decoded byte length of a `PAL16_Y8` payload.
pub const SURFACE_BYTES: usize = CHUNK_AREA * 3;

/// Decoded surface arrays, both exactly [`CHUNK_AREA`] long.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SurfaceCells {
    pub blocks: Vec<u16>,
    pub heights: Vec<u8>,
}

/// Decoded byte length of a `PAL16_U16LE_YZX` payload for `height` layers.
pub fn voxel_bytes(height: usize) -> usize {
    CHUNK_AREA * height * 2
}

/// Decode raw `PAL16_Y8` bytes.
pub fn decode_surface(bytes: &[u8]) -> Result<SurfaceCells, CodecError> {
    if bytes.len() != SURFACE_BYTES {
        return Err(CodecError::LengthMismatch {
            expected: SURFACE_BYTES,
            actual: bytes.len(),
        });
    }

    let mut blocks = Vec::with_capacity(CHUNK_AREA);
    let mut heights = Vec::with_capacity(CHUNK_AREA);
    for cell in bytes.chunks_exact(3) {
        blocks.push(u16::from_le_bytes([cell[0], cell[1]]));
        heights.push(cell[2]);
    }

    Ok(SurfaceCells { blocks, heights })
}

/// Decode raw `PAL16_U16LE_YZX` bytes for a world `height` layers tall.
pub fn decode_voxels(bytes: &[u8], height: usize) -> Result<Vec<u16>, CodecError> {
    let expected = voxel_bytes(height);
    if bytes.len() != expected {
        return Err(CodecError::LengthMismatch {
            expected,
            actual: bytes.len(),
        });
    }

    Ok(bytes
        .chunks_exact(2)
        .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
        .collect())
}

/// Check the encoding tag and decode a base64 surface payload.
pub fn decode_surface_payload(encoding: &str, data: &str) -> Result<SurfaceCells, CodecError> {
    if encoding != SURFACE_ENCODING {
        return Err(CodecError::UnknownEncoding(encoding.to_string()));
    }
    decode_surface(&BASE64.decode(data)?)
}

/// Check the encoding tag and decode a base64 voxel payload.
pub fn decode_voxel_payload(
    encoding: &str,
    data: &str,
    height: usize,
) -> Result<Vec<u16>, CodecError> {
    if encoding != VOXEL_ENCODING {
        return Err(CodecError::UnknownEncoding(encoding.to_string()));
    }
    decode_voxels(&BASE64.decode(data)?, height)
}

/// Base64-encode raw bytes the way the server does. Used by fixtures and
/// the loopback transport.
pub fn encode_base64(bytes: &[u8]) -> String {
    BASE64.encode(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn surface_reads_little_endian_block_then_height() {
        let mut bytes = vec![0u8; SURFACE_BYTES];
        bytes[0] = 0x34;
        bytes[1] = 0x12;
        bytes[2] = 21;
        let out = decode_surface(&bytes).unwrap();
        assert_eq!(out.blocks[0], 0x1234);
        assert_eq!(out.heights[0], 21);
        assert_eq!(out.blocks.len(), CHUNK_AREA);
        assert_eq!(out.heights.len(), CHUNK_AREA);
    }

    #[test]
    fn surface_rejects_wrong_length() {
        let err = decode_surface(&[0u8; 2]).unwrap_err();
        assert!(matches!(
            err,
            CodecError::LengthMismatch {
                expected: SURFACE_BYTES,
                actual: 2
            }
        ));
        assert!(decode_surface(&vec![0u8; SURFACE_BYTES + 1]).is_err());
    }

    #[test]
    fn surface_payload_rejects_short_base64() {
        assert!(matches!(
            decode_surface_payload(SURFACE_ENCODING, "AA=="),
            Err(CodecError::LengthMismatch { .. })
        ));
    }

    #[test]
    fn surface_payload_rejects_bad_base64() {
        assert!(matches!(
            decode_surface_payload(SURFACE_ENCODING, "!!not base64!!"),
            Err(CodecError::InvalidBase64(_))
        ));
    }

    #[test]
    fn unknown_encoding_is_rejected_before_decoding() {
        let data = encode_base64(&vec![0u8; SURFACE_BYTES]);
        assert!(matches!(
            decode_surface_payload("PAL8", &data),
            Err(CodecError::UnknownEncoding(ref e)) if e == "PAL8"
        ));
        assert!(matches!(
            decode_voxel_payload(SURFACE_ENCODING, &data, 1),
            Err(CodecError::UnknownEncoding(_))
        ));
    }

    #[test]
    fn voxels_read_little_endian_u16() {
        let height = 4;
        let mut bytes = vec![0u8; voxel_bytes(height)];
        bytes[0] = 0x34;
        bytes[1] = 0x12;
        let last = bytes.len() - 2;
        bytes[last] = 0x07;
        let out = decode_voxels(&bytes, height).unwrap();
        assert_eq!(out.len(), CHUNK_AREA * height);
        assert_eq!(out[0], 0x1234);
        assert_eq!(out[out.len() - 1], 7);
    }

    #[test]
    fn voxels_reject_length_for_other_height() {
        let bytes = vec![0u8; voxel_bytes(4)];
        assert!(decode_voxels(&bytes, 3).is_err());
        assert!(decode_voxels(&bytes, 5).is_err());
        assert!(decode_voxels(&[], 0).unwrap().is_empty());
    }

    #[test]
    fn surface_matches_formula_for_patterned_buffer() {
        let bytes: Vec<u8> = (0..SURFACE_BYTES).map(|i| (i * 7 % 251) as u8).collect();
        let out = decode_surface(&bytes).unwrap();
        for i in 0..CHUNK_AREA {
            let expected = bytes[3 * i] as u16 | (bytes[3 * i + 1] as u16) << 8;
            assert_eq!(out.blocks[i], expected);
            assert_eq!(out.heights[i], bytes[3 * i + 2]);
        }
    }
}
