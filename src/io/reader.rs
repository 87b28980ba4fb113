use ndarray::{ArrayD, IxDyn};
use std::fs::File;
use std::ops::Range;

use crate::backend::backends::OmFileReaderBackend;
use crate::backend::mmapfile::MmapFile;
use crate::codec::{fpx, lut, pfor};
use crate::core::compression::CompressionType;
use crate::core::delta2d::{delta2d_decode, delta2d_decode_xor};
use crate::core::dimensions::Dimensions;
use crate::core::header::OmHeader;
use crate::core::metadata::OmFileJson;
use crate::errors::OmFilesError;
use crate::utils::{divide_range, divide_rounded_up};

/// Decoded file metadata: the array descriptor plus the location of the
/// chunk lookup table.
pub struct OmVariable {
    pub name: Option<String>,
    pub dimensions: Dimensions,
    pub compression: CompressionType,
    pub scale_factor: f32,
    pub add_offset: f32,
    /// Absolute byte offset of the lookup table.
    lut_offset: u64,
    /// On-disk stride of one compressed sub-chunk; entry size for legacy
    /// files.
    lut_chunk_length: u64,
    /// Offsets per sub-chunk; unused for legacy files.
    lut_sub_chunk_size: u64,
    /// Legacy files store the table as raw little-endian u64 chunk end
    /// offsets, in front of the chunk stream.
    legacy_lut: bool,
    /// Absolute byte offset of the first compressed chunk.
    data_start: u64,
}

impl OmVariable {
    pub fn lut_offset(&self) -> u64 {
        self.lut_offset
    }

    pub fn lut_chunk_length(&self) -> u64 {
        self.lut_chunk_length
    }

    pub fn n_lut_sub_chunks(&self) -> u64 {
        if self.legacy_lut {
            self.dimensions.n_chunks()
        } else {
            divide_rounded_up(self.dimensions.n_chunks() + 1, self.lut_sub_chunk_size)
        }
    }
}

/// Cache of the most recently decompressed lookup-table sub-chunk. Reads
/// walk chunks in ascending order, so consecutive lookups usually hit.
struct LutCache {
    sub_chunk_index: u64,
    entries: Vec<u64>,
}

/// Random-access reader over any byte source.
pub struct OmFileReader<Backend: OmFileReaderBackend> {
    pub backend: Backend,
    pub variable: OmVariable,
}

impl<Backend: OmFileReaderBackend> OmFileReader<Backend> {
    /// Open a file: check magic and version, then parse either the legacy
    /// fixed header or the version 3 JSON trailer.
    pub fn new(backend: Backend) -> Result<Self, OmFilesError> {
        let file_size = backend.count();
        if file_size < OmHeader::LENGTH as u64 {
            return Err(OmFilesError::FileTooSmall);
        }
        let header_bytes = backend.get_bytes(0, OmHeader::LENGTH as u64)?;
        if header_bytes[0] != OmHeader::MAGIC_NUMBER1 || header_bytes[1] != OmHeader::MAGIC_NUMBER2
        {
            return Err(OmFilesError::NotAnOmFile);
        }
        let version = header_bytes[2];

        let variable = match version {
            1 | 2 => Self::open_legacy(&backend)?,
            3 => Self::open_v3(&backend)?,
            _ => return Err(OmFilesError::UnsupportedVersion(version)),
        };
        Ok(Self { backend, variable })
    }

    fn open_legacy(backend: &Backend) -> Result<OmVariable, OmFilesError> {
        let file_size = backend.count();
        if file_size < OmHeader::LEGACY_LENGTH as u64 {
            return Err(OmFilesError::FileTooSmall);
        }
        let header = OmHeader::legacy_from_bytes(
            backend.get_bytes(0, OmHeader::LEGACY_LENGTH as u64)?,
        )?;
        let dimensions = Dimensions::new(
            vec![header.dim0, header.dim1],
            vec![header.chunk0, header.chunk1],
        );
        let n_chunks = validate_geometry(&dimensions)?;
        let lut_offset = OmHeader::LEGACY_LENGTH as u64;
        let data_start = n_chunks
            .checked_mul(8)
            .and_then(|l| l.checked_add(lut_offset))
            .ok_or(OmFilesError::CorruptLut {
                reason: "lookup table exceeds file",
            })?;
        if data_start > file_size {
            return Err(OmFilesError::FileTooSmall);
        }
        Ok(OmVariable {
            name: None,
            dimensions,
            compression: header.compression,
            scale_factor: header.scale_factor,
            add_offset: 0.0,
            lut_offset,
            lut_chunk_length: 8,
            lut_sub_chunk_size: 0,
            legacy_lut: true,
            data_start,
        })
    }

    fn open_v3(backend: &Backend) -> Result<OmVariable, OmFilesError> {
        let file_size = backend.count();
        let trailer_len = OmHeader::TRAILER_LENGTH as u64;
        if file_size < OmHeader::LENGTH as u64 + trailer_len {
            return Err(OmFilesError::FileTooSmall);
        }
        backend.pre_read(file_size - trailer_len, trailer_len)?;
        let tail = backend.get_bytes(file_size - trailer_len, trailer_len)?;
        let json_length = u64::from_le_bytes(tail.try_into().expect("8 byte trailer"));
        if json_length
            .checked_add(trailer_len + OmHeader::LENGTH as u64)
            .map_or(true, |needed| needed > file_size)
        {
            return Err(OmFilesError::FileTooSmall);
        }
        let json_bytes = backend.get_bytes(file_size - trailer_len - json_length, json_length)?;
        let json: OmFileJson = serde_json::from_slice(json_bytes)
            .map_err(|e| OmFilesError::JsonError(e.to_string()))?;
        let v = json
            .variables
            .into_iter()
            .next()
            .ok_or_else(|| OmFilesError::JsonError("no variables in metadata".to_string()))?;

        if v.dimensions.len() != v.chunks.len() {
            return Err(OmFilesError::MismatchingDimensionCount {
                expected: v.dimensions.len(),
                got: v.chunks.len(),
            });
        }
        let dimensions = Dimensions::new(v.dimensions, v.chunks);
        let n_chunks = validate_geometry(&dimensions)?;
        if n_chunks != v.n_chunks {
            return Err(OmFilesError::CorruptLut {
                reason: "chunk count does not match dimensions",
            });
        }
        if v.lut_sub_chunk_size == 0 {
            return Err(OmFilesError::CorruptLut {
                reason: "zero sub-chunk size",
            });
        }
        let n_sub_chunks = divide_rounded_up(n_chunks + 1, v.lut_sub_chunk_size);
        let lut_end = n_sub_chunks
            .checked_mul(v.lut_chunk_length)
            .and_then(|l| l.checked_add(v.lut_offset))
            .ok_or(OmFilesError::CorruptLut {
                reason: "lookup table exceeds file",
            })?;
        if lut_end > file_size - trailer_len - json_length {
            return Err(OmFilesError::CorruptLut {
                reason: "lookup table exceeds file",
            });
        }
        Ok(OmVariable {
            name: v.name,
            dimensions,
            compression: v.compression,
            scale_factor: v.scale_factor,
            add_offset: v.add_offset,
            lut_offset: v.lut_offset,
            lut_chunk_length: v.lut_chunk_length,
            lut_sub_chunk_size: v.lut_sub_chunk_size,
            legacy_lut: false,
            data_start: OmHeader::LENGTH as u64,
        })
    }

    /// Fetch one lookup-table entry, decompressing its sub-chunk on a cache
    /// miss.
    fn lut_entry(&self, cache: &mut LutCache, index: u64) -> Result<u64, OmFilesError> {
        let v = &self.variable;
        if v.legacy_lut {
            // entry j is the end offset of chunk j-1; the stream starts at 0
            if index == 0 {
                return Ok(0);
            }
            let bytes = self.backend.get_bytes(v.lut_offset + (index - 1) * 8, 8)?;
            return Ok(u64::from_le_bytes(bytes.try_into().expect("8 byte entry")));
        }
        let sub = index / v.lut_sub_chunk_size;
        if cache.sub_chunk_index != sub {
            let n_entries_total = v.dimensions.n_chunks() + 1;
            let n = std::cmp::min(
                v.lut_sub_chunk_size,
                n_entries_total - sub * v.lut_sub_chunk_size,
            ) as usize;
            let bytes = self
                .backend
                .get_bytes(v.lut_offset + sub * v.lut_chunk_length, v.lut_chunk_length)?;
            lut::decompress(bytes, n, &mut cache.entries)?;
            cache.sub_chunk_index = sub;
        }
        Ok(cache.entries[(index % v.lut_sub_chunk_size) as usize])
    }

    /// Absolute byte range of one compressed chunk, validated against the
    /// extent of the chunk stream.
    fn chunk_byte_range(
        &self,
        cache: &mut LutCache,
        chunk_index: u64,
    ) -> Result<Range<u64>, OmFilesError> {
        let v = &self.variable;
        let start = self.lut_entry(cache, chunk_index)?;
        let end = self.lut_entry(cache, chunk_index + 1)?;
        if end < start {
            return Err(OmFilesError::CorruptLut {
                reason: "offsets not monotonic",
            });
        }
        let stream_end = if v.legacy_lut {
            self.backend.count()
        } else {
            v.lut_offset
        };
        if v.data_start.checked_add(end).map_or(true, |e| e > stream_end) {
            return Err(OmFilesError::CorruptLut {
                reason: "offset past end of chunk stream",
            });
        }
        Ok(v.data_start + start..v.data_start + end)
    }

    fn new_lut_cache(&self) -> LutCache {
        let v = &self.variable;
        let capacity = if v.legacy_lut {
            0
        } else {
            std::cmp::min(v.lut_sub_chunk_size, v.dimensions.n_chunks() + 1) as usize
        };
        LutCache {
            sub_chunk_index: u64::MAX,
            entries: vec![0; capacity],
        }
    }

    /// Read the window `dim_read` into `into`, a row-major buffer of shape
    /// `into_cube_dimension`, placing the data at `into_cube_offset`.
    ///
    /// Exactly the chunks intersecting the window are fetched and each is
    /// decompressed once.
    pub fn read_into(
        &self,
        into: &mut [f32],
        dim_read: &[Range<u64>],
        into_cube_offset: &[u64],
        into_cube_dimension: &[u64],
    ) -> Result<(), OmFilesError> {
        let v = &self.variable;
        let dims = &v.dimensions;
        let rank = dims.rank();

        dims.check_read_window(dim_read)?;
        for actual in [into_cube_offset.len(), into_cube_dimension.len()] {
            if actual != rank {
                return Err(OmFilesError::MismatchingDimensionCount {
                    expected: rank,
                    got: actual,
                });
            }
        }
        for i in 0..rank {
            let count = dim_read[i].end - dim_read[i].start;
            if into_cube_offset[i]
                .checked_add(count)
                .map_or(true, |end| end > into_cube_dimension[i])
            {
                return Err(OmFilesError::OffsetAndCountExceedDimension {
                    offset: into_cube_offset[i],
                    count,
                    dimension: into_cube_dimension[i],
                });
            }
        }
        if into.len() as u64 != into_cube_dimension.iter().product::<u64>() {
            return Err(OmFilesError::ChunkHasWrongNumberOfElements);
        }
        if dim_read.iter().any(|r| r.start == r.end) {
            return Ok(());
        }

        let mut cube_strides = vec![1u64; rank];
        for i in (0..rank - 1).rev() {
            cube_strides[i] = cube_strides[i + 1] * into_cube_dimension[i + 1];
        }

        let chunk_ranges: Vec<Range<u64>> = (0..rank)
            .map(|i| divide_range(&dim_read[i], dims.chunks[i]))
            .collect();

        let mut cache = self.new_lut_cache();
        let elements_per_chunk = dims.elements_per_chunk() as usize;
        let mut scratch = match v.compression {
            CompressionType::PforDelta2dInt16 | CompressionType::PforDelta2dInt16Logarithmic => {
                ChunkScratch::Int16(vec![0; elements_per_chunk])
            }
            CompressionType::FpxXor2d => ChunkScratch::Float(vec![0.0; elements_per_chunk]),
        };

        let mut coord: Vec<u64> = chunk_ranges.iter().map(|r| r.start).collect();
        'chunks: loop {
            self.read_one_chunk(
                &coord,
                dim_read,
                into,
                &cube_strides,
                into_cube_offset,
                &mut cache,
                &mut scratch,
            )?;
            for i in (0..rank).rev() {
                coord[i] += 1;
                if coord[i] < chunk_ranges[i].end {
                    continue 'chunks;
                }
                coord[i] = chunk_ranges[i].start;
            }
            break;
        }
        Ok(())
    }

    /// Fetch, decode and scatter the part of one chunk that overlaps the
    /// read window.
    #[allow(clippy::too_many_arguments)]
    fn read_one_chunk(
        &self,
        coord: &[u64],
        dim_read: &[Range<u64>],
        into: &mut [f32],
        cube_strides: &[u64],
        into_cube_offset: &[u64],
        cache: &mut LutCache,
        scratch: &mut ChunkScratch,
    ) -> Result<(), OmFilesError> {
        let v = &self.variable;
        let dims = &v.dimensions;
        let rank = dims.rank();

        let chunk_index = dims.chunk_index(coord);
        let byte_range = self.chunk_byte_range(cache, chunk_index)?;
        let n_bytes = (byte_range.end - byte_range.start) as usize;

        let lengths = dims.chunk_extent(coord);
        let n: usize = lengths.iter().product::<u64>() as usize;
        let length_last = lengths[rank - 1] as usize;
        let rows = n / length_last;

        if self.backend.needs_prefetch() {
            self.backend.prefetch_data(byte_range.start, n_bytes as u64);
        }
        self.backend.pre_read(byte_range.start, n_bytes as u64)?;
        let bytes = self.backend.get_bytes(byte_range.start, n_bytes as u64)?;

        // Clamp the chunk against the read window; both the chunk-local
        // source region and the destination base follow from the overlap.
        let global = dims.chunk_global_range(coord);
        let clamp = Dimensions::clamped(&global, dim_read);
        let local: Vec<Range<u64>> = (0..rank)
            .map(|i| clamp[i].start - global[i].start..clamp[i].end - global[i].start)
            .collect();
        let mut dst_base = 0u64;
        for i in 0..rank {
            dst_base += (clamp[i].start - dim_read[i].start + into_cube_offset[i]) * cube_strides[i];
        }

        let scale_factor = v.scale_factor;
        let add_offset = v.add_offset;

        match (v.compression, scratch) {
            (CompressionType::PforDelta2dInt16, ChunkScratch::Int16(scratch)) => {
                let consumed = pfor::decompress(bytes, n, scratch)?;
                check_consumed(chunk_index, n_bytes, consumed)?;
                delta2d_decode(rows, length_last, &mut scratch[..n]);
                scatter(&scratch[..n], &lengths, &local, into, cube_strides, dst_base, |q| {
                    if q == i16::MAX {
                        f32::NAN
                    } else {
                        q as f32 / scale_factor + add_offset
                    }
                });
            }
            (CompressionType::PforDelta2dInt16Logarithmic, ChunkScratch::Int16(scratch)) => {
                let consumed = pfor::decompress(bytes, n, scratch)?;
                check_consumed(chunk_index, n_bytes, consumed)?;
                delta2d_decode(rows, length_last, &mut scratch[..n]);
                scatter(&scratch[..n], &lengths, &local, into, cube_strides, dst_base, |q| {
                    if q == i16::MAX {
                        f32::NAN
                    } else {
                        10f32.powf(q as f32 / scale_factor + add_offset) - 1.0
                    }
                });
            }
            (CompressionType::FpxXor2d, ChunkScratch::Float(scratch)) => {
                let consumed = fpx::decompress(bytes, n, scratch)?;
                check_consumed(chunk_index, n_bytes, consumed)?;
                delta2d_decode_xor(rows, length_last, &mut scratch[..n]);
                scatter(&scratch[..n], &lengths, &local, into, cube_strides, dst_base, |x| x);
            }
            _ => unreachable!("scratch buffer type is fixed by the compression mode"),
        }
        Ok(())
    }

    /// Read a window and return it as a newly allocated row-major buffer.
    pub fn read(&self, dim_read: &[Range<u64>]) -> Result<Vec<f32>, OmFilesError> {
        let out_dims: Vec<u64> = dim_read
            .iter()
            .map(|r| r.end.saturating_sub(r.start))
            .collect();
        let n = out_dims.iter().product::<u64>() as usize;
        let mut out = vec![f32::NAN; n];
        self.read_into(&mut out, dim_read, &vec![0; dim_read.len()], &out_dims)?;
        Ok(out)
    }

    /// Read a window into an ndarray shaped like the request.
    pub fn read_nd(&self, dim_read: &[Range<u64>]) -> Result<ArrayD<f32>, OmFilesError> {
        let shape: Vec<usize> = dim_read
            .iter()
            .map(|r| r.end.saturating_sub(r.start) as usize)
            .collect();
        let data = self.read(dim_read)?;
        Ok(ArrayD::from_shape_vec(IxDyn(&shape), data).expect("window shape matches buffer"))
    }

    /// Advise the backend to fault in everything a subsequent read of
    /// `dim_read` will touch. Adjacent chunk ranges are coalesced into single
    /// advice calls.
    pub fn will_need(&self, dim_read: &[Range<u64>]) -> Result<(), OmFilesError> {
        if !self.backend.needs_prefetch() {
            return Ok(());
        }
        let dims = &self.variable.dimensions;
        dims.check_read_window(dim_read)?;
        if dim_read.iter().any(|r| r.start == r.end) {
            return Ok(());
        }

        let rank = dims.rank();
        let chunk_ranges: Vec<Range<u64>> = (0..rank)
            .map(|i| divide_range(&dim_read[i], dims.chunks[i]))
            .collect();

        let mut cache = self.new_lut_cache();
        let mut fetch: Option<Range<u64>> = None;
        let mut coord: Vec<u64> = chunk_ranges.iter().map(|r| r.start).collect();
        'chunks: loop {
            let byte_range = self.chunk_byte_range(&mut cache, dims.chunk_index(&coord))?;
            fetch = match fetch {
                Some(f) if f.end == byte_range.start => Some(f.start..byte_range.end),
                Some(f) => {
                    self.backend.prefetch_data(f.start, f.end - f.start);
                    Some(byte_range)
                }
                None => Some(byte_range),
            };
            for i in (0..rank).rev() {
                coord[i] += 1;
                if coord[i] < chunk_ranges[i].end {
                    continue 'chunks;
                }
                coord[i] = chunk_ranges[i].start;
            }
            break;
        }
        if let Some(f) = fetch {
            self.backend.prefetch_data(f.start, f.end - f.start);
        }
        Ok(())
    }
}

enum ChunkScratch {
    Int16(Vec<i16>),
    Float(Vec<f32>),
}

fn check_consumed(chunk_index: u64, expected: usize, actual: usize) -> Result<(), OmFilesError> {
    if expected != actual {
        return Err(OmFilesError::ChunkDecodeMismatch {
            chunk_index,
            expected: expected as u64,
            actual: actual as u64,
        });
    }
    Ok(())
}

/// Geometry sanity checks shared by both header formats. Returns the chunk
/// count, with all products verified to not overflow.
fn validate_geometry(dimensions: &Dimensions) -> Result<u64, OmFilesError> {
    if dimensions.rank() == 0 || dimensions.dims.iter().any(|&d| d == 0) {
        return Err(OmFilesError::DimensionMustBeLargerThan0);
    }
    if dimensions.chunks.iter().any(|&c| c == 0) {
        return Err(OmFilesError::DimensionMustBeLargerThan0);
    }
    if dimensions
        .dims
        .iter()
        .zip(&dimensions.chunks)
        .any(|(d, c)| c > d)
    {
        return Err(OmFilesError::ChunkDimensionIsSmallerThanOverallDim);
    }
    let mut n_elements: u64 = 1;
    let mut n_chunks: u64 = 1;
    for i in 0..dimensions.rank() {
        n_elements = n_elements
            .checked_mul(dimensions.dims[i])
            .ok_or(OmFilesError::CorruptLut {
                reason: "dimension product overflows",
            })?;
        n_chunks = n_chunks
            .checked_mul(dimensions.n_chunks_in_dimension(i))
            .ok_or(OmFilesError::CorruptLut {
                reason: "chunk count overflows",
            })?;
    }
    Ok(n_chunks)
}

/// Copy the clamped chunk-local region out of `scratch` into the output
/// cube, converting each element. The run along the last dimension is copied
/// per row.
fn scatter<T: Copy>(
    scratch: &[T],
    lengths: &[u64],
    local: &[Range<u64>],
    into: &mut [f32],
    cube_strides: &[u64],
    dst_base: u64,
    convert: impl Fn(T) -> f32,
) {
    let rank = lengths.len();
    let mut chunk_strides = vec![1u64; rank];
    for i in (0..rank - 1).rev() {
        chunk_strides[i] = chunk_strides[i + 1] * lengths[i + 1];
    }
    let run = (local[rank - 1].end - local[rank - 1].start) as usize;

    let slow = rank - 1;
    let mut row_coords = vec![0u64; slow];
    'rows: loop {
        let mut src = local[rank - 1].start;
        let mut dst = dst_base;
        for i in 0..slow {
            src += (local[i].start + row_coords[i]) * chunk_strides[i];
            dst += row_coords[i] * cube_strides[i];
        }
        let src = src as usize;
        let dst = dst as usize;
        for j in 0..run {
            into[dst + j] = convert(scratch[src + j]);
        }
        for i in (0..slow).rev() {
            row_coords[i] += 1;
            if row_coords[i] < local[i].end - local[i].start {
                continue 'rows;
            }
            row_coords[i] = 0;
        }
        break;
    }
}

impl OmFileReader<MmapFile> {
    /// Open an OM file from a path via a read-only memory map.
    pub fn from_file(path: &str) -> Result<Self, OmFilesError> {
        let file = File::open(path).map_err(|e| OmFilesError::CannotOpenFile {
            filename: path.to_string(),
            errno: e.raw_os_error().unwrap_or(0),
            error: e.to_string(),
        })?;
        let mmap = MmapFile::new(file).map_err(|e| OmFilesError::CannotOpenFile {
            filename: path.to_string(),
            errno: e.raw_os_error().unwrap_or(0),
            error: e.to_string(),
        })?;
        Self::new(mmap)
    }

    /// Check if the file was deleted on the file system. Linux keeps the
    /// file alive as long as some process has it open.
    pub fn was_deleted(&self) -> bool {
        self.backend.was_deleted()
    }
}
