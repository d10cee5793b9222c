//! Binary serialization of compressed matrix blocks
//!
//! Big-endian throughout. A stream starts with a one-byte compressed flag;
//! uncompressed blocks follow with their own layout, compressed blocks
//! with dimensions, nnz, and the tagged column groups. `exact_size_on_disk`
//! is byte-for-byte the count `write` produces.
//!
//! ```text
//! u8  compressed
//! if compressed:
//!   i32 rows; i32 cols; i64 nnz; i32 num_groups
//!   per group:
//!     u8  tag                       // 0 uncompressed, 1 OLE, 2 RLE
//!     i32 num_cols; i32 cols[...]   // ascending
//!     uncompressed: embedded block
//!     OLE/RLE: i32 num_tuples; per tuple:
//!       f64 values[num_cols]; i32 stream_len; u16 stream[...];
//!       u32 skip[num_segments]
//! ```

use crate::bitmap::num_segments;
use crate::block::{MatrixBlock, SparseRow};
use crate::error::{Result, ZipError};
use crate::group::{BitmapGroup, ColGroup};
use crate::matrix::{CompressedMatrix, SPARSITY_TURN_POINT};
use crate::ole::OleGroup;
use crate::rle::RleGroup;
use crate::uncomp::UncGroup;
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Read, Write};

const TAG_UNCOMPRESSED: u8 = 0;
const TAG_OLE: u8 = 1;
const TAG_RLE: u8 = 2;

fn read_dim<R: Read>(r: &mut R, what: &str) -> Result<usize> {
    let v = r.read_i32::<BigEndian>()?;
    if v < 0 {
        return Err(ZipError::InvariantViolation(format!(
            "negative {what} on deserialize: {v}"
        )));
    }
    Ok(v as usize)
}

impl MatrixBlock {
    /// Serialize this block.
    pub fn write<W: Write>(&self, w: &mut W) -> Result<()> {
        w.write_u8(self.is_sparse() as u8)?;
        w.write_i32::<BigEndian>(self.rows() as i32)?;
        w.write_i32::<BigEndian>(self.cols() as i32)?;
        w.write_i64::<BigEndian>(self.nnz() as i64)?;
        if let Some(d) = self.dense_data() {
            for &v in d {
                w.write_f64::<BigEndian>(v)?;
            }
        } else if let Some(rows) = self.sparse_rows() {
            for row in rows {
                w.write_i32::<BigEndian>(row.len() as i32)?;
                for (p, &c) in row.idx.iter().enumerate() {
                    w.write_i32::<BigEndian>(c as i32)?;
                    w.write_f64::<BigEndian>(row.val[p])?;
                }
            }
        }
        Ok(())
    }

    /// Deserialize a block written by [`MatrixBlock::write`].
    pub fn read<R: Read>(r: &mut R) -> Result<MatrixBlock> {
        let sparse = r.read_u8()? != 0;
        let rows = read_dim(r, "row count")?;
        let cols = read_dim(r, "column count")?;
        let nnz = r.read_i64::<BigEndian>()?;
        if nnz < 0 {
            return Err(ZipError::InvariantViolation(format!(
                "negative nnz on deserialize: {nnz}"
            )));
        }
        let mut blk = if sparse {
            let mut blk = MatrixBlock::new_sparse(rows, cols);
            if let Some(dst) = blk.sparse_mut() {
                for row in dst.iter_mut().take(rows) {
                    let len = r.read_i32::<BigEndian>()? as usize;
                    let mut sr = SparseRow {
                        idx: Vec::with_capacity(len),
                        val: Vec::with_capacity(len),
                    };
                    for _ in 0..len {
                        sr.idx.push(r.read_i32::<BigEndian>()? as u32);
                        sr.val.push(r.read_f64::<BigEndian>()?);
                    }
                    *row = sr;
                }
            }
            blk
        } else {
            let mut data = Vec::with_capacity(rows * cols);
            for _ in 0..rows * cols {
                data.push(r.read_f64::<BigEndian>()?);
            }
            MatrixBlock::from_raw_dense(rows, cols, data)
        };
        blk.nnz = nnz as usize;
        Ok(blk)
    }

    /// Serialized byte count of this block.
    pub fn exact_size_on_disk(&self) -> u64 {
        let header = 1 + 4 + 4 + 8;
        let payload: u64 = if let Some(rows) = self.sparse_rows() {
            rows.iter().map(|row| 4 + 12 * row.len() as u64).sum()
        } else {
            8 * (self.rows() * self.cols()) as u64
        };
        header + payload
    }
}

fn write_cols<W: Write>(w: &mut W, cols: &[usize]) -> Result<()> {
    w.write_i32::<BigEndian>(cols.len() as i32)?;
    for &c in cols {
        w.write_i32::<BigEndian>(c as i32)?;
    }
    Ok(())
}

fn read_cols<R: Read>(r: &mut R) -> Result<Vec<usize>> {
    let n = read_dim(r, "group column count")?;
    if n == 0 {
        return Err(ZipError::InvariantViolation(
            "empty column indices on deserialize".into(),
        ));
    }
    let mut cols = Vec::with_capacity(n);
    for _ in 0..n {
        cols.push(read_dim(r, "column index")?);
    }
    if !cols.windows(2).all(|w| w[0] < w[1]) {
        return Err(ZipError::InvariantViolation(
            "group column indices not ascending".into(),
        ));
    }
    Ok(cols)
}

fn write_bitmap_body<W: Write>(w: &mut W, bm: &BitmapGroup) -> Result<()> {
    write_cols(w, &bm.cols)?;
    let nseg = num_segments(bm.num_rows);
    w.write_i32::<BigEndian>(bm.num_tuples() as i32)?;
    for t in 0..bm.num_tuples() {
        for &v in bm.tuple_values(t) {
            w.write_f64::<BigEndian>(v)?;
        }
        let stream = bm.tuple_data(t);
        w.write_i32::<BigEndian>(stream.len() as i32)?;
        for &u in stream {
            w.write_u16::<BigEndian>(u)?;
        }
        // the trailing boundary equals the stream length; it is not
        // written and gets rebuilt on read
        for &p in &bm.tuple_skip(t)[..nseg] {
            w.write_u32::<BigEndian>(p)?;
        }
    }
    Ok(())
}

/// `min_delta` is 1 for OLE (every segment carries at least its count
/// header) and 0 for RLE (empty segments hold no pairs).
fn read_bitmap_body<R: Read>(r: &mut R, num_rows: usize, min_delta: u32) -> Result<BitmapGroup> {
    let cols = read_cols(r)?;
    let nseg = num_segments(num_rows);
    let num_tuples = read_dim(r, "tuple count")?;

    let mut values = Vec::with_capacity(num_tuples * cols.len());
    let mut ptr = vec![0usize];
    let mut data: Vec<u16> = Vec::new();
    let mut skip: Vec<u32> = Vec::new();

    for _ in 0..num_tuples {
        for _ in 0..cols.len() {
            values.push(r.read_f64::<BigEndian>()?);
        }
        let stream_len = read_dim(r, "stream length")?;
        for _ in 0..stream_len {
            data.push(r.read_u16::<BigEndian>()?);
        }
        let mut tuple_skip = Vec::with_capacity(nseg + 1);
        for _ in 0..nseg {
            tuple_skip.push(r.read_u32::<BigEndian>()?);
        }
        tuple_skip.push(stream_len as u32);
        let consistent = tuple_skip.first() == Some(&0)
            && tuple_skip
                .windows(2)
                .all(|w| w[0].saturating_add(min_delta) <= w[1] && w[1] <= stream_len as u32);
        if nseg > 0 && !consistent {
            return Err(ZipError::InvariantViolation(
                "inconsistent skip table on deserialize".into(),
            ));
        }
        skip.extend(tuple_skip);
        ptr.push(data.len());
    }

    Ok(BitmapGroup {
        cols,
        num_rows,
        values,
        ptr,
        data,
        skip,
    })
}

fn bitmap_body_size(bm: &BitmapGroup) -> u64 {
    let nseg = num_segments(bm.num_rows) as u64;
    let ncols = bm.cols.len() as u64;
    let per_tuple = 8 * ncols + 4 + 4 * nseg;
    4 + 4 * ncols + 4 + bm.num_tuples() as u64 * per_tuple + 2 * bm.data.len() as u64
}

impl ColGroup {
    pub(crate) fn write<W: Write>(&self, w: &mut W) -> Result<()> {
        match self {
            ColGroup::Uncompressed(g) => {
                w.write_u8(TAG_UNCOMPRESSED)?;
                write_cols(w, g.cols())?;
                g.data().write(w)
            }
            ColGroup::Ole(g) => {
                w.write_u8(TAG_OLE)?;
                write_bitmap_body(w, g.bm())
            }
            ColGroup::Rle(g) => {
                w.write_u8(TAG_RLE)?;
                write_bitmap_body(w, g.bm())
            }
        }
    }

    pub(crate) fn read<R: Read>(r: &mut R, num_rows: usize) -> Result<ColGroup> {
        let tag = r.read_u8()?;
        match tag {
            TAG_UNCOMPRESSED => {
                let cols = read_cols(r)?;
                let data = MatrixBlock::read(r)?;
                Ok(ColGroup::Uncompressed(UncGroup::from_parts(cols, data)))
            }
            TAG_OLE => Ok(ColGroup::Ole(OleGroup::with_storage(read_bitmap_body(
                r, num_rows, 1,
            )?))),
            TAG_RLE => Ok(ColGroup::Rle(RleGroup::with_storage(read_bitmap_body(
                r, num_rows, 0,
            )?))),
            other => Err(ZipError::InvariantViolation(format!(
                "column group type tag out of range: {other}"
            ))),
        }
    }

    pub(crate) fn exact_size_on_disk(&self) -> u64 {
        1 + match self {
            ColGroup::Uncompressed(g) => {
                4 + 4 * g.cols().len() as u64 + g.data().exact_size_on_disk()
            }
            ColGroup::Ole(g) => bitmap_body_size(g.bm()),
            ColGroup::Rle(g) => bitmap_body_size(g.bm()),
        }
    }
}

impl CompressedMatrix {
    /// Serialize this matrix, compressed or not.
    pub fn write<W: Write>(&self, w: &mut W) -> Result<()> {
        w.write_u8(self.is_compressed() as u8)?;
        if !self.is_compressed() {
            return self.decompress(1)?.write(w);
        }
        let groups = self.col_groups();
        w.write_i32::<BigEndian>(self.rows() as i32)?;
        w.write_i32::<BigEndian>(self.cols() as i32)?;
        w.write_i64::<BigEndian>(self.nnz() as i64)?;
        w.write_i32::<BigEndian>(groups.len() as i32)?;
        for g in groups {
            g.write(w)?;
        }
        Ok(())
    }

    /// Deserialize a matrix written by [`CompressedMatrix::write`].
    pub fn read<R: Read>(r: &mut R) -> Result<CompressedMatrix> {
        let compressed = r.read_u8()? != 0;
        if !compressed {
            return Ok(CompressedMatrix::from_block(MatrixBlock::read(r)?));
        }
        let rows = read_dim(r, "row count")?;
        let cols = read_dim(r, "column count")?;
        let nnz = r.read_i64::<BigEndian>()?;
        if nnz < 0 {
            return Err(ZipError::InvariantViolation(format!(
                "negative nnz on deserialize: {nnz}"
            )));
        }
        let n_groups = read_dim(r, "group count")?;
        let mut groups = Vec::with_capacity(n_groups);
        for _ in 0..n_groups {
            groups.push(ColGroup::read(r, rows)?);
        }
        let sparsity = if rows * cols > 0 {
            nnz as f64 / (rows * cols) as f64
        } else {
            0.0
        };
        Ok(CompressedMatrix::from_parts(
            rows,
            cols,
            nnz as usize,
            sparsity < SPARSITY_TURN_POINT,
            groups,
        ))
    }

    /// Serialized byte count; equals exactly what `write` produces.
    pub fn exact_size_on_disk(&self) -> u64 {
        if !self.is_compressed() {
            return 1 + self
                .decompress(1)
                .map(|b| b.exact_size_on_disk())
                .unwrap_or(0);
        }
        1 + 4
            + 4
            + 8
            + 4
            + self
                .col_groups()
                .iter()
                .map(ColGroup::exact_size_on_disk)
                .sum::<u64>()
    }
}
