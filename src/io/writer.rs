use ndarray::ArrayViewD;
use std::fs::File;
use std::path::Path;

use crate::backend::backends::{InMemoryBackend, OmFileWriterBackend};
use crate::codec::{fpx, lut, pfor};
use crate::core::compression::{compressed_chunk_bound, CompressionType};
use crate::core::delta2d::{delta2d_encode, delta2d_encode_xor};
use crate::core::dimensions::Dimensions;
use crate::core::header::OmHeader;
use crate::core::metadata::{OmFileJson, OmFileJsonVariable};
use crate::errors::OmFilesError;
use crate::io::buffered_writer::OmBufferedWriter;
use crate::utils::divide_rounded_up;

/// Number of lookup-table offsets compressed into one sub-chunk. Production
/// files use 256; tests may use smaller values to exercise sub-chunk
/// boundaries.
pub const DEFAULT_LUT_SUB_CHUNK_SIZE: u64 = 256;

/// Typed scratch for one uncompressed chunk, fixed by the compression mode.
enum ChunkScratch {
    Int16(Vec<i16>),
    Float(Vec<f32>),
}

/// Streaming writer for a single-variable OM file.
///
/// Chunks must be supplied in ascending chunk order; one `write_data` call
/// may cover any contiguous run of chunks, including all of them. Sealing
/// with [`OmFileWriter::write_lut_and_trailer`] emits the compressed lookup
/// table and the JSON trailer.
pub struct OmFileWriter<Backend: OmFileWriterBackend> {
    buffer: OmBufferedWriter<Backend>,
    dimensions: Dimensions,
    compression: CompressionType,
    scale_factor: f32,
    add_offset: f32,
    lut_sub_chunk_size: u64,
    /// Cumulative compressed chunk end offsets, relative to the start of the
    /// chunk stream. Entry 0 is always 0.
    look_up_table: Vec<u64>,
    chunk_index: u64,
    scratch: ChunkScratch,
    compressed_chunk_bound: usize,
    sealed: bool,
}

impl<Backend: OmFileWriterBackend> OmFileWriter<Backend> {
    pub fn new(
        backend: Backend,
        dimensions: Vec<u64>,
        chunk_dimensions: Vec<u64>,
        compression: CompressionType,
        scale_factor: f32,
        add_offset: f32,
    ) -> Result<Self, OmFilesError> {
        Self::new_with_lut_sub_chunk_size(
            backend,
            dimensions,
            chunk_dimensions,
            compression,
            scale_factor,
            add_offset,
            DEFAULT_LUT_SUB_CHUNK_SIZE,
        )
    }

    pub fn new_with_lut_sub_chunk_size(
        backend: Backend,
        dimensions: Vec<u64>,
        chunk_dimensions: Vec<u64>,
        compression: CompressionType,
        scale_factor: f32,
        add_offset: f32,
        lut_sub_chunk_size: u64,
    ) -> Result<Self, OmFilesError> {
        if dimensions.len() != chunk_dimensions.len() {
            return Err(OmFilesError::MismatchingDimensionCount {
                expected: dimensions.len(),
                got: chunk_dimensions.len(),
            });
        }
        if dimensions.is_empty()
            || dimensions.iter().any(|&d| d == 0)
            || chunk_dimensions.iter().any(|&c| c == 0)
        {
            return Err(OmFilesError::DimensionMustBeLargerThan0);
        }
        if dimensions
            .iter()
            .zip(&chunk_dimensions)
            .any(|(d, c)| c > d)
        {
            return Err(OmFilesError::ChunkDimensionIsSmallerThanOverallDim);
        }
        debug_assert!(lut_sub_chunk_size > 0);

        let dimensions = Dimensions::new(dimensions, chunk_dimensions);
        let elements_per_chunk = dimensions.elements_per_chunk() as usize;
        let bound = compressed_chunk_bound(elements_per_chunk, compression.bytes_per_element());
        let scratch = match compression {
            CompressionType::PforDelta2dInt16 | CompressionType::PforDelta2dInt16Logarithmic => {
                ChunkScratch::Int16(vec![0; elements_per_chunk])
            }
            CompressionType::FpxXor2d => ChunkScratch::Float(vec![0.0; elements_per_chunk]),
        };
        let n_chunks = dimensions.n_chunks() as usize;

        Ok(Self {
            buffer: OmBufferedWriter::new(backend, std::cmp::max(4096, bound)),
            dimensions,
            compression,
            scale_factor,
            add_offset,
            lut_sub_chunk_size,
            look_up_table: vec![0; n_chunks + 1],
            chunk_index: 0,
            scratch,
            compressed_chunk_bound: bound,
            sealed: false,
        })
    }

    pub fn dimensions(&self) -> &Dimensions {
        &self.dimensions
    }

    /// Emit the three fixed header bytes. Called implicitly by the first
    /// `write_data` if needed.
    pub fn write_header(&mut self) -> Result<(), OmFilesError> {
        if self.buffer.total_bytes_written > 0 {
            return Ok(());
        }
        self.buffer.append(&[
            OmHeader::MAGIC_NUMBER1,
            OmHeader::MAGIC_NUMBER2,
            OmHeader::VERSION,
        ])
    }

    /// Encode and append all chunks covered by the selected window of
    /// `array`.
    ///
    /// `array` is a row-major buffer of shape `array_dimensions`;
    /// `array_offset`/`array_count` select the part holding the data for the
    /// next chunks. Defaults: the whole array, which must then match the
    /// file dimensions for a one-call write.
    pub fn write_data(
        &mut self,
        array: &[f32],
        array_dimensions: Option<&[u64]>,
        array_offset: Option<&[u64]>,
        array_count: Option<&[u64]>,
    ) -> Result<(), OmFilesError> {
        if self.sealed {
            return Err(OmFilesError::WriterAlreadySealed);
        }
        let rank = self.dimensions.rank();
        let array_dimensions: Vec<u64> = array_dimensions
            .map(|d| d.to_vec())
            .unwrap_or_else(|| self.dimensions.dims.clone());
        let array_offset: Vec<u64> = array_offset
            .map(|o| o.to_vec())
            .unwrap_or_else(|| vec![0; array_dimensions.len()]);
        let array_count: Vec<u64> = array_count
            .map(|c| c.to_vec())
            .unwrap_or_else(|| array_dimensions.clone());

        for actual in [array_dimensions.len(), array_offset.len(), array_count.len()] {
            if actual != rank {
                return Err(OmFilesError::MismatchingDimensionCount {
                    expected: rank,
                    got: actual,
                });
            }
        }
        if array.len() as u64 != array_dimensions.iter().product::<u64>() {
            return Err(OmFilesError::ChunkHasWrongNumberOfElements);
        }
        for i in 0..rank {
            if array_offset[i]
                .checked_add(array_count[i])
                .map_or(true, |end| end > array_dimensions[i])
            {
                return Err(OmFilesError::OffsetAndCountExceedDimension {
                    offset: array_offset[i],
                    count: array_count[i],
                    dimension: array_dimensions[i],
                });
            }
        }

        self.write_header()?;

        let chunks = self.dimensions.chunks.clone();
        let local_grid: Vec<u64> = (0..rank)
            .map(|i| divide_rounded_up(array_count[i], chunks[i]))
            .collect();
        let chunks_in_call: u64 = local_grid.iter().product();

        let total = self.dimensions.n_chunks();
        if self.chunk_index + chunks_in_call > total {
            return Err(OmFilesError::TooManyChunksWritten { total });
        }

        // Row-major element strides of the supplied array
        let mut strides = vec![1u64; rank];
        for i in (0..rank - 1).rev() {
            strides[i] = strides[i + 1] * array_dimensions[i + 1];
        }

        // Chunk coordinates where this call starts in the file's chunk grid
        let base = self.dimensions.chunk_coordinate(self.chunk_index);

        for c_offset in 0..chunks_in_call {
            // Chunk coordinates within this call's window, last dimension
            // fastest, matching the global chunk order.
            let mut local = vec![0u64; rank];
            let mut rolling = 1u64;
            for i in (0..rank).rev() {
                local[i] = (c_offset / rolling) % local_grid[i];
                rolling *= local_grid[i];
            }

            let global = self.dimensions.chunk_coordinate(self.chunk_index);
            let lengths = self.dimensions.chunk_extent(&global);

            // The window must supply whole chunks forming a contiguous run in
            // global chunk order: each local chunk has to land exactly on the
            // next global chunk and match its extent.
            let mut read_base = 0u64;
            for i in 0..rank {
                if base[i] + local[i] != global[i] {
                    return Err(OmFilesError::ChunkHasWrongNumberOfElements);
                }
                let local_extent = std::cmp::min((local[i] + 1) * chunks[i], array_count[i])
                    - local[i] * chunks[i];
                if local_extent != lengths[i] {
                    return Err(OmFilesError::ChunkHasWrongNumberOfElements);
                }
                read_base += (local[i] * chunks[i] + array_offset[i]) * strides[i];
            }

            self.encode_single_chunk(array, &strides, read_base, &lengths, &array_dimensions)?;

            self.look_up_table[(self.chunk_index + 1) as usize] =
                self.buffer.total_bytes_written - OmHeader::LENGTH as u64;
            self.chunk_index += 1;
        }

        Ok(())
    }

    /// `write_data` for an ndarray view. The view must be in standard
    /// (row-major, contiguous) layout.
    pub fn write_data_nd(
        &mut self,
        array: ArrayViewD<'_, f32>,
        array_offset: Option<&[u64]>,
        array_count: Option<&[u64]>,
    ) -> Result<(), OmFilesError> {
        let array_dimensions: Vec<u64> = array.shape().iter().map(|&d| d as u64).collect();
        let slice = array.as_slice().ok_or(OmFilesError::ArrayNotContiguous)?;
        self.write_data(slice, Some(&array_dimensions), array_offset, array_count)
    }

    /// Gather one chunk into the scratch buffer, filter, entropy-code and
    /// append it to the output buffer, flushing to the backend whenever the
    /// next worst-case chunk would no longer fit.
    fn encode_single_chunk(
        &mut self,
        array: &[f32],
        strides: &[u64],
        read_base: u64,
        lengths: &[u64],
        array_dimensions: &[u64],
    ) -> Result<(), OmFilesError> {
        let rank = lengths.len();
        let n: usize = lengths.iter().product::<u64>() as usize;
        let length_last = lengths[rank - 1] as usize;
        let rows = n / length_last;

        // Collapse trailing dimensions the chunk reads in full into a single
        // run, so long contiguous stretches copy without per-row overhead.
        let mut first_uncollapsed = rank - 1;
        while first_uncollapsed > 0 && lengths[first_uncollapsed] == array_dimensions[first_uncollapsed]
        {
            first_uncollapsed -= 1;
        }
        let run: usize = lengths[first_uncollapsed..]
            .iter()
            .product::<u64>() as usize;
        let gather_lengths = &lengths[..=first_uncollapsed];

        self.buffer.reallocate(self.compressed_chunk_bound)?;

        let scale_factor = self.scale_factor;
        let add_offset = self.add_offset;
        let buffer = &mut self.buffer;
        let scratch = &mut self.scratch;

        let written = match (self.compression, scratch) {
            (CompressionType::PforDelta2dInt16, ChunkScratch::Int16(scratch)) => {
                gather(
                    array,
                    strides,
                    read_base,
                    gather_lengths,
                    run,
                    &mut scratch[..n],
                    |v| quantize(v, scale_factor, add_offset),
                );
                delta2d_encode(rows, length_last, &mut scratch[..n]);
                pfor::compress(&scratch[..n], buffer.buffer_at_write_position())
            }
            (CompressionType::PforDelta2dInt16Logarithmic, ChunkScratch::Int16(scratch)) => {
                gather(
                    array,
                    strides,
                    read_base,
                    gather_lengths,
                    run,
                    &mut scratch[..n],
                    |v| quantize((1.0 + v).log10(), scale_factor, add_offset),
                );
                delta2d_encode(rows, length_last, &mut scratch[..n]);
                pfor::compress(&scratch[..n], buffer.buffer_at_write_position())
            }
            (CompressionType::FpxXor2d, ChunkScratch::Float(scratch)) => {
                gather(
                    array,
                    strides,
                    read_base,
                    gather_lengths,
                    run,
                    &mut scratch[..n],
                    |v| v,
                );
                delta2d_encode_xor(rows, length_last, &mut scratch[..n]);
                fpx::compress(&scratch[..n], buffer.buffer_at_write_position())
            }
            _ => unreachable!("scratch buffer type is fixed by the compression mode"),
        };

        self.buffer.increment_write_position(written);
        Ok(())
    }

    /// Compress the lookup table into equally sized sub-chunks, then emit the
    /// JSON metadata and its length as the 8-byte file tail. Seals the
    /// writer.
    pub fn write_lut_and_trailer(&mut self, name: Option<String>) -> Result<(), OmFilesError> {
        if self.sealed {
            return Err(OmFilesError::WriterAlreadySealed);
        }
        let expected = self.dimensions.n_chunks();
        if self.chunk_index != expected {
            return Err(OmFilesError::NotAllChunksWritten {
                written: self.chunk_index,
                expected,
            });
        }
        self.write_header()?;

        let lut_offset = self.buffer.total_bytes_written;
        let sub_chunk_size = self.lut_sub_chunk_size as usize;

        let lut_chunk_length = self
            .look_up_table
            .chunks(sub_chunk_size)
            .map(lut::compressed_size)
            .max()
            .unwrap_or(0) as u64;

        for sub_chunk in self.look_up_table.chunks(sub_chunk_size) {
            self.buffer.reallocate(lut_chunk_length as usize)?;
            let written = lut::compress(sub_chunk, self.buffer.buffer_at_write_position());
            debug_assert!(written as u64 <= lut_chunk_length);
            // Pad every sub-chunk to the common stride
            self.buffer.increment_write_position(lut_chunk_length as usize);
        }

        let metadata = OmFileJson {
            variables: vec![OmFileJsonVariable {
                name,
                dimensions: self.dimensions.dims.clone(),
                chunks: self.dimensions.chunks.clone(),
                dimension_names: None,
                scale_factor: self.scale_factor,
                add_offset: self.add_offset,
                compression: self.compression,
                n_chunks: expected,
                lut_offset,
                lut_chunk_length,
                lut_sub_chunk_size: self.lut_sub_chunk_size,
            }],
        };
        let json = serde_json::to_vec(&metadata).map_err(|e| OmFilesError::JsonError(e.to_string()))?;
        self.buffer.append(&json)?;
        self.buffer.append(&(json.len() as u64).to_le_bytes())?;
        self.buffer.flush()?;
        self.buffer.backend.synchronize()?;
        self.sealed = true;
        Ok(())
    }
}

/// Saturating int16 quantization with the NaN sentinel.
///
/// `i16::MAX` is reserved for NaN; finite values clamp one step inside the
/// int16 range so the sentinel stays unambiguous.
#[inline(always)]
fn quantize(transformed: f32, scale_factor: f32, add_offset: f32) -> i16 {
    let scaled = (transformed - add_offset) * scale_factor;
    if scaled.is_nan() {
        i16::MAX
    } else {
        scaled
            .round()
            .clamp((i16::MIN + 1) as f32, (i16::MAX - 1) as f32) as i16
    }
}

/// Copy the chunk-shaped region at `read_base` out of `array` into `scratch`
/// in chunk-local row-major order, converting each element. `run` elements
/// along the collapsed fast dimensions are copied per row.
fn gather<T: Copy>(
    array: &[f32],
    strides: &[u64],
    read_base: u64,
    gather_lengths: &[u64],
    run: usize,
    scratch: &mut [T],
    convert: impl Fn(f32) -> T,
) {
    let slow = gather_lengths.len() - 1;
    let rows = scratch.len() / run;
    let mut row_coords = vec![0u64; slow];
    for r in 0..rows {
        let mut src = read_base;
        for i in 0..slow {
            src += row_coords[i] * strides[i];
        }
        let src = src as usize;
        for (dst, &v) in scratch[r * run..(r + 1) * run]
            .iter_mut()
            .zip(&array[src..src + run])
        {
            *dst = convert(v);
        }
        for i in (0..slow).rev() {
            row_coords[i] += 1;
            if row_coords[i] < gather_lengths[i] {
                break;
            }
            row_coords[i] = 0;
        }
    }
}

/// Write a full array as one OM file into a fresh in-memory backend.
pub fn write_all_in_memory(
    dimensions: Vec<u64>,
    chunk_dimensions: Vec<u64>,
    compression: CompressionType,
    scale_factor: f32,
    add_offset: f32,
    data: &[f32],
) -> Result<InMemoryBackend, OmFilesError> {
    let mut backend = InMemoryBackend::new(Vec::new());
    let mut writer = OmFileWriter::new(
        &mut backend,
        dimensions,
        chunk_dimensions,
        compression,
        scale_factor,
        add_offset,
    )?;
    writer.write_data(data, None, None, None)?;
    writer.write_lut_and_trailer(None)?;
    drop(writer);
    Ok(backend)
}

/// Write a full array to `path`, staging in a `{path}~` temporary and
/// renaming on success so readers never observe a half-written file.
pub fn write_all_to_file(
    path: &str,
    dimensions: Vec<u64>,
    chunk_dimensions: Vec<u64>,
    compression: CompressionType,
    scale_factor: f32,
    add_offset: f32,
    data: &[f32],
    overwrite: bool,
) -> Result<(), OmFilesError> {
    if !overwrite && Path::new(path).exists() {
        return Err(OmFilesError::FileExistsAlready {
            filename: path.to_string(),
        });
    }
    let path_temp = format!("{}~", path);
    if Path::new(&path_temp).exists() {
        std::fs::remove_file(&path_temp).map_err(|e| OmFilesError::CannotOpenFile {
            filename: path_temp.clone(),
            errno: e.raw_os_error().unwrap_or(0),
            error: e.to_string(),
        })?;
    }
    let file = File::create(&path_temp).map_err(|e| OmFilesError::CannotOpenFile {
        filename: path_temp.clone(),
        errno: e.raw_os_error().unwrap_or(0),
        error: e.to_string(),
    })?;
    let mut writer = OmFileWriter::new(
        file,
        dimensions,
        chunk_dimensions,
        compression,
        scale_factor,
        add_offset,
    )?;
    writer.write_data(data, None, None, None)?;
    writer.write_lut_and_trailer(None)?;
    std::fs::rename(&path_temp, path).map_err(|e| OmFilesError::CannotMoveFile {
        from: path_temp,
        to: path.to_string(),
        error: e.to_string(),
    })?;
    Ok(())
}
