//! The Nisitenma-Ichigo file table: a list of compressed segments packed back
//! to back in the ROM, found by searching for its marker string.
//!
//! Layout around the marker (all values big-endian):
//!
//! ```text
//! decomp_table_start        8-byte entries, 24-bit decompressed size at +5
//! marker - 4                (4 bytes)
//! marker                    "Nisitenma-Ichigo"
//! marker + 16               8-byte entries [flag|start:3][flag|end:3],
//!                           terminated by an entry whose start is zero
//! ```
//!
//! Segments are decompressed the first time anything touches them. On
//! [`Container::repack`] every decompressed segment is recompressed and all
//! segments are laid out again from the first segment's original address,
//! since any size change moves every segment after it.

use std::ops::Range;
use tracing::{debug, info};

use crate::codec::{Lzkn64, SegmentCodec};
use crate::{RepackError, Result};

pub const MARKER: &[u8; 16] = b"Nisitenma-Ichigo";

const TABLE_OFFSET: usize = 0x10;
const ENTRY_SIZE: usize = 8;
const ADDRESS_MASK: usize = 0x00FF_FFFF;
/// Offset of the 24-bit size inside a decompressed-size table entry.
const SIZE_FIELD_OFFSET: usize = 5;

struct Segment {
    start: usize,
    end: usize,
    compressed: Vec<u8>,
    /// Set once the segment has been decompressed; the compressed bytes are
    /// stale from then on.
    decompressed: Option<Vec<u8>>,
}

/// Summary of one segment as it currently stands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentInfo {
    pub id: u32,
    pub start: usize,
    pub end: usize,
    pub compressed_len: usize,
    /// Size stored in the decompressed-size table.
    pub recorded_len: usize,
    pub decompressed: bool,
}

/// Where a segment ended up after a repack.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Placement {
    pub id: u32,
    pub old_start: usize,
    pub old_end: usize,
    pub start: usize,
    pub end: usize,
    /// New decompressed size, for segments that were recompressed.
    pub decompressed_len: Option<usize>,
}

/// Output of [`Container::repack`].
#[derive(Debug)]
pub struct Repacked {
    pub image: Vec<u8>,
    pub placements: Vec<Placement>,
}

pub struct Container<C: SegmentCodec = Lzkn64> {
    image: Vec<u8>,
    codec: C,
    marker_offset: usize,
    table_start: usize,
    data_start: usize,
    decomp_table_start: usize,
    segments: Vec<Segment>,
}

fn be_u24(buf: &[u8], at: usize) -> Option<usize> {
    let b = buf.get(at..at.checked_add(3)?)?;
    Some(((b[0] as usize) << 16) | ((b[1] as usize) << 8) | b[2] as usize)
}

fn put_be_u24(buf: &mut [u8], at: usize, value: usize) -> Result<()> {
    if value > ADDRESS_MASK {
        return Err(RepackError::ImageOverflow {
            end: value,
            limit: ADDRESS_MASK,
        });
    }
    let size = buf.len();
    let slot = at
        .checked_add(3)
        .and_then(|end| buf.get_mut(at..end))
        .ok_or(RepackError::OutOfBounds {
            id: 0,
            offset: at,
            len: 3,
            size,
        })?;
    slot.copy_from_slice(&[(value >> 16) as u8, (value >> 8) as u8, value as u8]);
    Ok(())
}

fn checked_range(id: u32, size: usize, offset: usize, len: usize) -> Result<Range<usize>> {
    match offset.checked_add(len) {
        Some(end) if end <= size => Ok(offset..end),
        _ => Err(RepackError::OutOfBounds {
            id,
            offset,
            len,
            size,
        }),
    }
}

/// Reads the 24-bit address of a file-table field, dropping its flag byte.
fn table_address(image: &[u8], field: usize) -> Result<usize> {
    be_u24(image, field + 1).ok_or_else(|| {
        RepackError::MalformedContainer(format!(
            "file table entry at 0x{field:X} runs past the end of the image"
        ))
    })
}

impl Container<Lzkn64> {
    /// Opens a container whose segments are LZKN64 streams.
    pub fn open(image: Vec<u8>) -> Result<Self> {
        Self::with_codec(image, Lzkn64)
    }
}

impl<C: SegmentCodec> Container<C> {
    pub fn with_codec(image: Vec<u8>, codec: C) -> Result<Self> {
        let marker_offset = image
            .windows(MARKER.len())
            .position(|w| w == MARKER)
            .ok_or_else(|| {
                RepackError::MalformedContainer("Nisitenma-Ichigo marker not found".to_string())
            })?;

        let table_start = marker_offset + TABLE_OFFSET;

        let mut segments = Vec::new();
        loop {
            let entry = table_start + segments.len() * ENTRY_SIZE;
            let start = table_address(&image, entry)?;
            if start == 0 {
                break;
            }
            let end = table_address(&image, entry + 4)?;

            if end < start || end > image.len() {
                return Err(RepackError::MalformedContainer(format!(
                    "segment {} spans 0x{start:X}..0x{end:X} in a 0x{:X}-byte image",
                    segments.len() + 1,
                    image.len()
                )));
            }

            segments.push(Segment {
                start,
                end,
                compressed: image[start..end].to_vec(),
                decompressed: None,
            });
        }

        let data_start = segments.first().map_or(0, |s| s.start);

        // The size table runs backwards from the marker, one entry per id
        // with a slot for id 0.
        let decomp_table_start = marker_offset
            .checked_sub(4 + ENTRY_SIZE * (segments.len() + 1))
            .ok_or_else(|| {
                RepackError::MalformedContainer(format!(
                    "decompressed-size table for {} segments would start before the image",
                    segments.len()
                ))
            })?;

        info!(
            marker = marker_offset,
            segments = segments.len(),
            data_start,
            "opened Nisitenma-Ichigo table"
        );

        Ok(Container {
            image,
            codec,
            marker_offset,
            table_start,
            data_start,
            decomp_table_start,
            segments,
        })
    }

    pub fn marker_offset(&self) -> usize {
        self.marker_offset
    }

    pub fn table_start(&self) -> usize {
        self.table_start
    }

    /// Address the first segment starts at; repacking lays segments out from here.
    pub fn data_start(&self) -> usize {
        self.data_start
    }

    pub fn decomp_table_start(&self) -> usize {
        self.decomp_table_start
    }

    pub fn segment_count(&self) -> usize {
        self.segments.len()
    }

    fn segment(&self, id: u32) -> Result<&Segment> {
        let count = self.segments.len();
        (id as usize)
            .checked_sub(1)
            .and_then(|index| self.segments.get(index))
            .ok_or(RepackError::NoSuchSegment { id, count })
    }

    fn size_field(&self, id: u32) -> usize {
        self.decomp_table_start + id as usize * ENTRY_SIZE + SIZE_FIELD_OFFSET
    }

    pub fn segment_info(&self, id: u32) -> Result<SegmentInfo> {
        let segment = self.segment(id)?;
        Ok(SegmentInfo {
            id,
            start: segment.start,
            end: segment.end,
            compressed_len: segment.compressed.len(),
            recorded_len: be_u24(&self.image, self.size_field(id)).unwrap_or(0),
            decompressed: segment.decompressed.is_some(),
        })
    }

    pub fn segments(&self) -> Vec<SegmentInfo> {
        (1..=self.segments.len() as u32)
            .filter_map(|id| self.segment_info(id).ok())
            .collect()
    }

    /// Compressed bytes of a segment as they were read from the image.
    pub fn compressed_segment(&self, id: u32) -> Result<&[u8]> {
        Ok(&self.segment(id)?.compressed)
    }

    pub fn is_decompressed(&self, id: u32) -> bool {
        self.segment(id)
            .map(|s| s.decompressed.is_some())
            .unwrap_or(false)
    }

    /// Mutable view of a segment's decompressed bytes, or of the image itself
    /// for id 0. Decompresses the segment on first use.
    pub fn segment_mut(&mut self, id: u32) -> Result<&mut [u8]> {
        if id == 0 {
            return Ok(&mut self.image);
        }

        let count = self.segments.len();
        let codec = &self.codec;
        let segment = (id as usize)
            .checked_sub(1)
            .and_then(|index| self.segments.get_mut(index))
            .ok_or(RepackError::NoSuchSegment { id, count })?;

        let data = match segment.decompressed.take() {
            Some(data) => data,
            None => {
                let data = codec.decompress(&segment.compressed)?;
                debug!(
                    id,
                    compressed = segment.compressed.len(),
                    decompressed = data.len(),
                    "decompressed segment"
                );
                data
            }
        };

        Ok(segment.decompressed.insert(data))
    }

    pub fn read_bytes(&mut self, id: u32, offset: usize, len: usize) -> Result<&[u8]> {
        let buf = self.segment_mut(id)?;
        let range = checked_range(id, buf.len(), offset, len)?;
        Ok(&buf[range])
    }

    pub fn write_bytes(&mut self, id: u32, offset: usize, values: &[u8]) -> Result<()> {
        let buf = self.segment_mut(id)?;
        let range = checked_range(id, buf.len(), offset, values.len())?;
        buf[range].copy_from_slice(values);
        Ok(())
    }

    pub fn read_u8(&mut self, id: u32, offset: usize) -> Result<u8> {
        Ok(self.read_bytes(id, offset, 1)?[0])
    }

    pub fn read_u16(&mut self, id: u32, offset: usize) -> Result<u16> {
        let b = self.read_bytes(id, offset, 2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    pub fn read_u24(&mut self, id: u32, offset: usize) -> Result<u32> {
        let b = self.read_bytes(id, offset, 3)?;
        Ok(u32::from_be_bytes([0, b[0], b[1], b[2]]))
    }

    pub fn read_u32(&mut self, id: u32, offset: usize) -> Result<u32> {
        let b = self.read_bytes(id, offset, 4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn write_u8(&mut self, id: u32, offset: usize, value: u8) -> Result<()> {
        self.write_bytes(id, offset, &[value])
    }

    pub fn write_u16(&mut self, id: u32, offset: usize, value: u16) -> Result<()> {
        self.write_bytes(id, offset, &value.to_be_bytes())
    }

    /// Writes the low 24 bits of `value`.
    pub fn write_u24(&mut self, id: u32, offset: usize, value: u32) -> Result<()> {
        self.write_bytes(id, offset, &value.to_be_bytes()[1..])
    }

    pub fn write_u32(&mut self, id: u32, offset: usize, value: u32) -> Result<()> {
        self.write_bytes(id, offset, &value.to_be_bytes())
    }

    pub fn write_u16s(&mut self, id: u32, offset: usize, values: &[u16]) -> Result<()> {
        let bytes: Vec<u8> = values.iter().flat_map(|v| v.to_be_bytes()).collect();
        self.write_bytes(id, offset, &bytes)
    }

    pub fn write_u24s(&mut self, id: u32, offset: usize, values: &[u32]) -> Result<()> {
        let bytes: Vec<u8> = values
            .iter()
            .flat_map(|v| {
                let [_, a, b, c] = v.to_be_bytes();
                [a, b, c]
            })
            .collect();
        self.write_bytes(id, offset, &bytes)
    }

    pub fn write_u32s(&mut self, id: u32, offset: usize, values: &[u32]) -> Result<()> {
        let bytes: Vec<u8> = values.iter().flat_map(|v| v.to_be_bytes()).collect();
        self.write_bytes(id, offset, &bytes)
    }

    /// Recompresses every decompressed segment and lays all segments out
    /// again, in id order, from [`data_start`](Self::data_start).
    ///
    /// Bytes past the new end of the segment data are left as they were.
    pub fn repack(mut self) -> Result<Repacked> {
        let limit = self.image.len().min(ADDRESS_MASK + 1);
        // Size table, marker and file table including its terminator.
        let tables =
            self.decomp_table_start..self.table_start + ENTRY_SIZE * (self.segments.len() + 1);
        let mut placements = Vec::with_capacity(self.segments.len());
        let mut cursor = self.data_start;

        for (index, segment) in self.segments.iter_mut().enumerate() {
            let id = index as u32 + 1;

            let decompressed_len = match &segment.decompressed {
                Some(data) => {
                    segment.compressed = self.codec.compress(data)?;
                    let size_field =
                        self.decomp_table_start + id as usize * ENTRY_SIZE + SIZE_FIELD_OFFSET;
                    put_be_u24(&mut self.image, size_field, data.len())?;
                    Some(data.len())
                }
                None => None,
            };

            let start = cursor;
            let end = start + segment.compressed.len();
            if end > limit {
                return Err(RepackError::ImageOverflow { end, limit });
            }
            if start < tables.end && end > tables.start {
                return Err(RepackError::ImageOverflow {
                    end,
                    limit: tables.start,
                });
            }

            self.image[start..end].copy_from_slice(&segment.compressed);

            let entry = self.table_start + index * ENTRY_SIZE;
            put_be_u24(&mut self.image, entry + 1, start)?;
            put_be_u24(&mut self.image, entry + 5, end)?;

            debug!(
                id,
                old_start = segment.start,
                start,
                len = end - start,
                recompressed = decompressed_len.is_some(),
                "placed segment"
            );

            placements.push(Placement {
                id,
                old_start: segment.start,
                old_end: segment.end,
                start,
                end,
                decompressed_len,
            });

            cursor = end;
        }

        let old_end = self
            .segments
            .iter()
            .map(|s| s.end)
            .max()
            .unwrap_or(self.data_start);
        if cursor < old_end {
            debug!(
                stale = old_end - cursor,
                "segment data shrank; trailing bytes left in place"
            );
        }

        info!(
            segments = placements.len(),
            recompressed = placements
                .iter()
                .filter(|p| p.decompressed_len.is_some())
                .count(),
            data_end = cursor,
            "repacked Nisitenma-Ichigo table"
        );

        Ok(Repacked {
            image: self.image,
            placements,
        })
    }

    /// Repacks and returns the rewritten image.
    pub fn into_bytes(self) -> Result<Vec<u8>> {
        Ok(self.repack()?.image)
    }
}
