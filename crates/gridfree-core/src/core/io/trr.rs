//! Reader and writer for GROMACS TRR trajectories.
//!
//! Frames are self-describing XDR (big-endian) records: a header with the
//! magic number, a version string, the byte size of every section, the atom
//! count, step, time and coupling parameter, followed by the box, virial,
//! pressure, position, velocity and force sections. The float precision of a
//! frame is inferred from the declared section sizes.

use nalgebra::{Matrix3, Vector3};
use std::fs::File;
use std::io::{self, BufReader, ErrorKind, Read, Seek, SeekFrom, Write};
use std::ops::Range;
use std::path::Path;
use thiserror::Error;

const MAGIC: i32 = 1993;
const VERSION: &str = "GMX_trn_file";
const DIM: usize = 3;
/// Longest version string accepted in a frame header.
const MAX_VERSION_LEN: usize = 64;

#[derive(Debug, Error)]
pub enum TrrError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("Bad magic number {found} at byte {offset}")]
    BadMagic { found: i32, offset: u64 },
    #[error("Unexpected version string '{0}'")]
    BadVersion(String),
    #[error("Negative size for header field '{0}'")]
    NegativeSize(&'static str),
    #[error("Unsupported non-empty '{0}' section")]
    UnsupportedSection(&'static str),
    #[error("Unable to infer float size: all data sections are empty")]
    UnknownPrecision,
    #[error("Unexpected float size of {0} bytes")]
    StrangePrecision(usize),
    #[error("Frame {requested} requested but the trajectory has {available} frames")]
    FrameOutOfRange { requested: usize, available: usize },
    #[error("Atom range {start}..{end} exceeds the {natoms} atoms of the frame")]
    AtomRange {
        start: usize,
        end: usize,
        natoms: usize,
    },
    #[error("Frame at byte {offset} has no position section")]
    MissingPositions { offset: u64 },
    #[error("Trajectory contains no frames")]
    Empty,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Precision {
    Single,
    Double,
}

impl Precision {
    pub fn size(self) -> usize {
        match self {
            Precision::Single => 4,
            Precision::Double => 8,
        }
    }

    fn from_size(size: usize) -> Result<Self, TrrError> {
        match size {
            4 => Ok(Precision::Single),
            8 => Ok(Precision::Double),
            other => Err(TrrError::StrangePrecision(other)),
        }
    }
}

/// Decoded frame header plus its location in the file.
#[derive(Debug, Clone, PartialEq)]
pub struct FrameHeader {
    pub box_size: usize,
    pub vir_size: usize,
    pub pres_size: usize,
    pub x_size: usize,
    pub v_size: usize,
    pub f_size: usize,
    pub natoms: usize,
    pub step: i32,
    pub time: f64,
    pub lambda: f64,
    pub precision: Precision,
    pub offset: u64,
    pub header_size: u64,
}

impl FrameHeader {
    fn body_size(&self) -> u64 {
        (self.box_size + self.vir_size + self.pres_size + self.x_size + self.v_size + self.f_size)
            as u64
    }

    pub fn frame_size(&self) -> u64 {
        self.header_size + self.body_size()
    }

    /// Byte offset of the next frame.
    pub fn end(&self) -> u64 {
        self.offset + self.frame_size()
    }

    fn box_offset(&self) -> u64 {
        self.offset + self.header_size
    }

    fn positions_offset(&self) -> u64 {
        self.box_offset() + (self.box_size + self.vir_size + self.pres_size) as u64
    }
}

#[derive(Debug, Clone)]
pub struct TrrFrame {
    pub header: FrameHeader,
    pub cell: Option<Matrix3<f64>>,
    pub positions: Vec<Vector3<f64>>,
}

fn read_i32(reader: &mut impl Read) -> io::Result<i32> {
    let mut buf = [0u8; 4];
    reader.read_exact(&mut buf)?;
    Ok(i32::from_be_bytes(buf))
}

fn read_real(reader: &mut impl Read, precision: Precision) -> io::Result<f64> {
    match precision {
        Precision::Single => {
            let mut buf = [0u8; 4];
            reader.read_exact(&mut buf)?;
            Ok(f64::from(f32::from_be_bytes(buf)))
        }
        Precision::Double => {
            let mut buf = [0u8; 8];
            reader.read_exact(&mut buf)?;
            Ok(f64::from_be_bytes(buf))
        }
    }
}

fn read_reals(reader: &mut impl Read, count: usize, precision: Precision) -> io::Result<Vec<f64>> {
    (0..count).map(|_| read_real(reader, precision)).collect()
}

fn size_field(value: i32, name: &'static str) -> Result<usize, TrrError> {
    usize::try_from(value).map_err(|_| TrrError::NegativeSize(name))
}

fn infer_precision(
    box_size: usize,
    x_size: usize,
    v_size: usize,
    f_size: usize,
    natoms: usize,
) -> Result<Precision, TrrError> {
    let per_atom = natoms * DIM;
    let size = if box_size > 0 {
        box_size / (DIM * DIM)
    } else if x_size > 0 && per_atom > 0 {
        x_size / per_atom
    } else if v_size > 0 && per_atom > 0 {
        v_size / per_atom
    } else if f_size > 0 && per_atom > 0 {
        f_size / per_atom
    } else {
        return Err(TrrError::UnknownPrecision);
    };
    Precision::from_size(size)
}

pub struct TrrReader<R> {
    inner: R,
}

impl TrrReader<BufReader<File>> {
    pub fn open(path: &Path) -> Result<Self, TrrError> {
        Ok(Self::new(BufReader::new(File::open(path)?)))
    }
}

impl<R: Read + Seek> TrrReader<R> {
    pub fn new(inner: R) -> Self {
        Self { inner }
    }

    /// Decodes the header starting at `offset`; `None` at a clean end of file.
    fn header_at(&mut self, offset: u64) -> Result<Option<FrameHeader>, TrrError> {
        self.inner.seek(SeekFrom::Start(offset))?;
        let magic = match read_i32(&mut self.inner) {
            Ok(magic) => magic,
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        if magic != MAGIC {
            return Err(TrrError::BadMagic {
                found: magic,
                offset,
            });
        }
        let _slen = read_i32(&mut self.inner)?;
        let len = size_field(read_i32(&mut self.inner)?, "version")?;
        if len > MAX_VERSION_LEN {
            return Err(TrrError::BadVersion(format!("<{len} byte version string>")));
        }
        let mut version = vec![0u8; len + (4 - len % 4) % 4];
        self.inner.read_exact(&mut version)?;
        version.truncate(len);
        let version = String::from_utf8_lossy(&version).into_owned();
        if version != VERSION {
            return Err(TrrError::BadVersion(version));
        }

        const NAMES: [&str; 10] = [
            "ir", "e", "box", "vir", "pres", "top", "sym", "x", "v", "f",
        ];
        let mut sizes = [0usize; 10];
        for (slot, name) in sizes.iter_mut().zip(NAMES) {
            *slot = size_field(read_i32(&mut self.inner)?, name)?;
        }
        let [ir, e, box_size, vir_size, pres_size, top, sym, x_size, v_size, f_size] = sizes;
        for (size, name) in [(ir, "ir"), (e, "e"), (top, "top"), (sym, "sym")] {
            if size != 0 {
                return Err(TrrError::UnsupportedSection(name));
            }
        }
        let natoms = size_field(read_i32(&mut self.inner)?, "natoms")?;
        let step = read_i32(&mut self.inner)?;
        let _nre = read_i32(&mut self.inner)?;

        let precision = infer_precision(box_size, x_size, v_size, f_size, natoms)?;
        let time = read_real(&mut self.inner, precision)?;
        let lambda = read_real(&mut self.inner, precision)?;
        let header_size = self.inner.stream_position()? - offset;

        Ok(Some(FrameHeader {
            box_size,
            vir_size,
            pres_size,
            x_size,
            v_size,
            f_size,
            natoms,
            step,
            time,
            lambda,
            precision,
            offset,
            header_size,
        }))
    }

    /// Walks all frame headers from the start of the file.
    pub fn headers(&mut self) -> Result<Vec<FrameHeader>, TrrError> {
        let mut headers = Vec::new();
        let mut offset = 0;
        while let Some(header) = self.header_at(offset)? {
            offset = header.end();
            headers.push(header);
        }
        Ok(headers)
    }

    pub fn count_frames(&mut self) -> Result<usize, TrrError> {
        Ok(self.headers()?.len())
    }

    /// Header of zero-based frame `n`, found by walking the frame sizes.
    pub fn seek_frame(&mut self, n: usize) -> Result<FrameHeader, TrrError> {
        let mut offset = 0;
        let mut index = 0;
        loop {
            let header = self
                .header_at(offset)?
                .ok_or(TrrError::FrameOutOfRange {
                    requested: n,
                    available: index,
                })?;
            if index == n {
                return Ok(header);
            }
            offset = header.end();
            index += 1;
        }
    }

    /// Reads the box and the positions of `atoms` for one frame.
    pub fn read_frame(
        &mut self,
        header: &FrameHeader,
        atoms: Range<usize>,
    ) -> Result<TrrFrame, TrrError> {
        if atoms.start > atoms.end || atoms.end > header.natoms {
            return Err(TrrError::AtomRange {
                start: atoms.start,
                end: atoms.end,
                natoms: header.natoms,
            });
        }
        if header.x_size == 0 {
            return Err(TrrError::MissingPositions {
                offset: header.offset,
            });
        }
        let precision = header.precision;

        let cell = if header.box_size > 0 {
            self.inner.seek(SeekFrom::Start(header.box_offset()))?;
            let values = read_reals(&mut self.inner, DIM * DIM, precision)?;
            Some(Matrix3::from_row_slice(&values))
        } else {
            None
        };

        let skip = (atoms.start * DIM * precision.size()) as u64;
        self.inner
            .seek(SeekFrom::Start(header.positions_offset() + skip))?;
        let values = read_reals(&mut self.inner, atoms.len() * DIM, precision)?;
        let positions = values
            .chunks_exact(DIM)
            .map(|p| Vector3::new(p[0], p[1], p[2]))
            .collect();

        Ok(TrrFrame {
            header: header.clone(),
            cell,
            positions,
        })
    }

    /// Reads every frame, restricted to the given atom range.
    pub fn read_all(&mut self, atoms: Range<usize>) -> Result<Vec<TrrFrame>, TrrError> {
        let headers = self.headers()?;
        if headers.is_empty() {
            return Err(TrrError::Empty);
        }
        headers
            .iter()
            .map(|header| self.read_frame(header, atoms.clone()))
            .collect()
    }

    /// The undecoded bytes of one frame, header included.
    pub fn raw_frame(&mut self, header: &FrameHeader) -> Result<Vec<u8>, TrrError> {
        self.inner.seek(SeekFrom::Start(header.offset))?;
        let mut bytes = vec![0u8; header.frame_size() as usize];
        self.inner.read_exact(&mut bytes)?;
        Ok(bytes)
    }
}

/// Writes frames holding a box and positions.
pub struct TrrWriter<W> {
    inner: W,
    precision: Precision,
}

impl<W: Write> TrrWriter<W> {
    pub fn new(inner: W, precision: Precision) -> Self {
        Self { inner, precision }
    }

    fn write_i32(&mut self, value: i32) -> io::Result<()> {
        self.inner.write_all(&value.to_be_bytes())
    }

    fn write_real(&mut self, value: f64) -> io::Result<()> {
        match self.precision {
            Precision::Single => self.inner.write_all(&(value as f32).to_be_bytes()),
            Precision::Double => self.inner.write_all(&value.to_be_bytes()),
        }
    }

    pub fn write_frame(
        &mut self,
        step: i32,
        time: f64,
        cell: Option<&Matrix3<f64>>,
        positions: &[Vector3<f64>],
    ) -> Result<(), TrrError> {
        let real = self.precision.size();
        let box_size = if cell.is_some() { DIM * DIM * real } else { 0 };
        let x_size = positions.len() * DIM * real;
        let to_i32 = |v: usize, name| i32::try_from(v).map_err(|_| TrrError::NegativeSize(name));

        self.write_i32(MAGIC)?;
        self.write_i32(VERSION.len() as i32 + 1)?;
        self.write_i32(VERSION.len() as i32)?;
        self.inner.write_all(VERSION.as_bytes())?;
        let sizes = [0, 0, to_i32(box_size, "box")?, 0, 0, 0, 0, to_i32(x_size, "x")?, 0, 0];
        for size in sizes {
            self.write_i32(size)?;
        }
        self.write_i32(to_i32(positions.len(), "natoms")?)?;
        self.write_i32(step)?;
        self.write_i32(0)?;
        self.write_real(time)?;
        self.write_real(0.0)?;

        if let Some(cell) = cell {
            for row in cell.row_iter() {
                for value in row.iter() {
                    self.write_real(*value)?;
                }
            }
        }
        for p in positions {
            for value in p.iter() {
                self.write_real(*value)?;
            }
        }
        Ok(())
    }

    pub fn into_inner(self) -> W {
        self.inner
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn positions(n: usize, shift: f64) -> Vec<Vector3<f64>> {
        (0..n)
            .map(|i| Vector3::new(i as f64 + shift, 2.0 * i as f64, -(i as f64)))
            .collect()
    }

    fn encoded(precision: Precision, frames: usize, with_box: bool) -> Vec<u8> {
        let mut writer = TrrWriter::new(Vec::new(), precision);
        let cell = Matrix3::new(3.0, 0.0, 0.0, 0.5, 3.0, 0.0, 0.25, 0.5, 3.0);
        for f in 0..frames {
            writer
                .write_frame(
                    f as i32 * 10,
                    f as f64,
                    with_box.then_some(&cell),
                    &positions(5, f as f64),
                )
                .unwrap();
        }
        writer.into_inner()
    }

    #[test]
    fn single_precision_header_has_expected_size() {
        let mut reader = TrrReader::new(Cursor::new(encoded(Precision::Single, 1, true)));
        let header = reader.seek_frame(0).unwrap();
        assert_eq!(header.header_size, 84);
        assert_eq!(header.precision, Precision::Single);
        assert_eq!(header.natoms, 5);
    }

    #[test]
    fn counts_frames_and_seeks_by_walking_sizes() {
        let mut reader = TrrReader::new(Cursor::new(encoded(Precision::Double, 4, true)));
        assert_eq!(reader.count_frames().unwrap(), 4);
        let header = reader.seek_frame(2).unwrap();
        assert_eq!(header.step, 20);
        assert_eq!(header.time, 2.0);
        assert!(matches!(
            reader.seek_frame(9),
            Err(TrrError::FrameOutOfRange { requested: 9, available: 4 })
        ));
    }

    #[test]
    fn reads_box_and_atom_subrange() {
        let mut reader = TrrReader::new(Cursor::new(encoded(Precision::Double, 3, true)));
        let header = reader.seek_frame(1).unwrap();
        let frame = reader.read_frame(&header, 2..4).unwrap();
        assert_eq!(frame.positions, positions(5, 1.0)[2..4].to_vec());
        let cell = frame.cell.unwrap();
        assert_eq!(cell[(1, 0)], 0.5);
        assert_eq!(cell[(0, 1)], 0.0);
    }

    #[test]
    fn frames_without_box_infer_precision_from_positions() {
        let mut reader = TrrReader::new(Cursor::new(encoded(Precision::Single, 2, false)));
        let frames = reader.read_all(0..5).unwrap();
        assert_eq!(frames.len(), 2);
        assert!(frames[0].cell.is_none());
        assert_eq!(frames[1].positions[4], Vector3::new(5.0, 8.0, -4.0));
    }

    #[test]
    fn atom_range_beyond_natoms_is_rejected() {
        let mut reader = TrrReader::new(Cursor::new(encoded(Precision::Single, 1, true)));
        let header = reader.seek_frame(0).unwrap();
        assert!(matches!(
            reader.read_frame(&header, 3..6),
            Err(TrrError::AtomRange { natoms: 5, .. })
        ));
    }

    #[test]
    fn oversized_version_string_is_rejected() {
        let mut bytes = encoded(Precision::Single, 1, true);
        bytes[8..12].copy_from_slice(&i32::MAX.to_be_bytes());
        let mut reader = TrrReader::new(Cursor::new(bytes));
        assert!(matches!(reader.headers(), Err(TrrError::BadVersion(_))));
    }

    #[test]
    fn corrupt_magic_is_reported() {
        let mut bytes = encoded(Precision::Single, 1, true);
        bytes[3] = 0;
        let mut reader = TrrReader::new(Cursor::new(bytes));
        assert!(matches!(reader.headers(), Err(TrrError::BadMagic { .. })));
    }

    #[test]
    fn raw_frame_round_trips_through_reader() {
        let bytes = encoded(Precision::Single, 2, true);
        let mut reader = TrrReader::new(Cursor::new(bytes));
        let header = reader.seek_frame(1).unwrap();
        let raw = reader.raw_frame(&header).unwrap();
        let mut single = TrrReader::new(Cursor::new(raw));
        let frames = single.read_all(0..5).unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].header.step, 10);
    }

    #[test]
    fn empty_input_has_no_frames() {
        let mut reader = TrrReader::new(Cursor::new(Vec::new()));
        assert!(matches!(reader.read_all(0..1), Err(TrrError::Empty)));
    }
}
