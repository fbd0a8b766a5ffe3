//! NumPy `.npy` output and stored-zip bundling.
//!
//! Dataset exports write one v1 `.npy` file per logical array and bundle
//! them into a single `.zip`. The npy header is rewritten on finalize
//! with the actual row count, so arrays can be streamed without knowing
//! their length up front. The zip writer uses the store method only;
//! captures are already high-entropy.

use std::io::{
    Seek,
    SeekFrom,
    Write,
};

/// `\x93NUMPY` + version 1.0.
const NPY_MAGIC: &[u8; 8] = b"\x93NUMPY\x01\x00";

/// Header sizes are padded up to this alignment.
const NPY_ALIGN: usize = 64;

fn npy_dict(dtype: &str, rows: u64, columns: usize) -> String {
    let shape = if columns == 1 {
        format!("({rows},)")
    }
    else {
        format!("({rows}, {columns})")
    };
    format!("{{'descr': '{dtype}', 'fortran_order': False, 'shape': {shape}, }}")
}

/// Full header size: magic + u16 length + dict + padding + newline,
/// sized for the worst-case row count so the finalize rewrite always
/// fits.
fn npy_header_size(dtype: &str, columns: usize) -> usize {
    let worst = npy_dict(dtype, u64::MAX, columns).len();
    (NPY_MAGIC.len() + 2 + worst + 1).div_ceil(NPY_ALIGN) * NPY_ALIGN
}

fn write_npy_header<W: Write>(
    mut writer: W,
    dtype: &str,
    rows: u64,
    columns: usize,
    full_size: usize,
) -> std::io::Result<()> {
    let dict = npy_dict(dtype, rows, columns);
    let header_size = (full_size - NPY_MAGIC.len() - 2) as u16;

    writer.write_all(NPY_MAGIC)?;
    writer.write_all(&header_size.to_le_bytes())?;
    writer.write_all(dict.as_bytes())?;

    let pad = full_size - NPY_MAGIC.len() - 2 - dict.len() - 1;
    writer.write_all(&vec![b' '; pad])?;
    writer.write_all(b"\n")?;
    Ok(())
}

/// Streams one array into `.npy` form. The element type is fixed by its
/// numpy descr (`<f4`, `<c8`, `<i2`, …).
pub struct NpyWriter<W> {
    inner: W,
    dtype: String,
    columns: usize,
    rows: u64,
    full_header_size: usize,
}

impl<W: Write + Seek> NpyWriter<W> {
    pub fn new(mut inner: W, dtype: &str, columns: usize) -> std::io::Result<Self> {
        let full_header_size = npy_header_size(dtype, columns);
        write_npy_header(&mut inner, dtype, 0, columns, full_header_size)?;
        Ok(Self {
            inner,
            dtype: dtype.to_owned(),
            columns,
            rows: 0,
            full_header_size,
        })
    }

    /// Append one row of little-endian f32 values.
    pub fn append_f32_row(&mut self, row: &[f32]) -> std::io::Result<()> {
        assert_eq!(row.len(), self.columns);
        for value in row {
            self.inner.write_all(&value.to_le_bytes())?;
        }
        self.rows += 1;
        Ok(())
    }

    /// Append many single-column f32 rows at once.
    pub fn append_f32(&mut self, values: &[f32]) -> std::io::Result<()> {
        assert_eq!(self.columns, 1);
        for value in values {
            self.inner.write_all(&value.to_le_bytes())?;
        }
        self.rows += values.len() as u64;
        Ok(())
    }

    /// Rewrite the header with the final shape and return the stream.
    pub fn finalize(mut self) -> std::io::Result<W> {
        self.inner.flush()?;
        self.inner.seek(SeekFrom::Start(0))?;
        write_npy_header(
            &mut self.inner,
            &self.dtype,
            self.rows,
            self.columns,
            self.full_header_size,
        )?;
        self.inner.seek(SeekFrom::End(0))?;
        self.inner.flush()?;
        Ok(self.inner)
    }
}

fn crc32(data: &[u8]) -> u32 {
    let mut crc = 0xffff_ffffu32;
    for &byte in data {
        crc ^= byte as u32;
        for _ in 0..8 {
            let mask = (crc & 1).wrapping_neg();
            crc = (crc >> 1) ^ (0xedb8_8320 & mask);
        }
    }
    !crc
}

struct ZipEntry {
    name: String,
    crc: u32,
    size: u32,
    offset: u32,
}

/// Store-only zip writer: one call per member file, then `finish`.
pub struct ZipWriter<W> {
    inner: W,
    entries: Vec<ZipEntry>,
    offset: u32,
}

impl<W: Write> ZipWriter<W> {
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            entries: Vec::new(),
            offset: 0,
        }
    }

    pub fn add_file(&mut self, name: &str, data: &[u8]) -> std::io::Result<()> {
        let crc = crc32(data);
        let size = data.len() as u32;

        // local file header, store method, no flags
        self.inner.write_all(&0x04034b50u32.to_le_bytes())?;
        self.inner.write_all(&20u16.to_le_bytes())?; // version needed
        self.inner.write_all(&0u16.to_le_bytes())?; // flags
        self.inner.write_all(&0u16.to_le_bytes())?; // method: store
        self.inner.write_all(&0u16.to_le_bytes())?; // mod time
        self.inner.write_all(&0u16.to_le_bytes())?; // mod date
        self.inner.write_all(&crc.to_le_bytes())?;
        self.inner.write_all(&size.to_le_bytes())?;
        self.inner.write_all(&size.to_le_bytes())?;
        self.inner.write_all(&(name.len() as u16).to_le_bytes())?;
        self.inner.write_all(&0u16.to_le_bytes())?; // extra length
        self.inner.write_all(name.as_bytes())?;
        self.inner.write_all(data)?;

        self.entries.push(ZipEntry {
            name: name.to_owned(),
            crc,
            size,
            offset: self.offset,
        });
        self.offset += 30 + name.len() as u32 + size;
        Ok(())
    }

    pub fn finish(mut self) -> std::io::Result<W> {
        let central_start = self.offset;
        let mut central_size = 0u32;

        for entry in &self.entries {
            self.inner.write_all(&0x02014b50u32.to_le_bytes())?;
            self.inner.write_all(&20u16.to_le_bytes())?; // version made by
            self.inner.write_all(&20u16.to_le_bytes())?; // version needed
            self.inner.write_all(&0u16.to_le_bytes())?; // flags
            self.inner.write_all(&0u16.to_le_bytes())?; // method
            self.inner.write_all(&0u16.to_le_bytes())?; // mod time
            self.inner.write_all(&0u16.to_le_bytes())?; // mod date
            self.inner.write_all(&entry.crc.to_le_bytes())?;
            self.inner.write_all(&entry.size.to_le_bytes())?;
            self.inner.write_all(&entry.size.to_le_bytes())?;
            self.inner
                .write_all(&(entry.name.len() as u16).to_le_bytes())?;
            self.inner.write_all(&0u16.to_le_bytes())?; // extra
            self.inner.write_all(&0u16.to_le_bytes())?; // comment
            self.inner.write_all(&0u16.to_le_bytes())?; // disk number
            self.inner.write_all(&0u16.to_le_bytes())?; // internal attrs
            self.inner.write_all(&0u32.to_le_bytes())?; // external attrs
            self.inner.write_all(&entry.offset.to_le_bytes())?;
            self.inner.write_all(entry.name.as_bytes())?;
            central_size += 46 + entry.name.len() as u32;
        }

        // end of central directory
        self.inner.write_all(&0x06054b50u32.to_le_bytes())?;
        self.inner.write_all(&0u16.to_le_bytes())?; // disk number
        self.inner.write_all(&0u16.to_le_bytes())?; // central dir disk
        self.inner
            .write_all(&(self.entries.len() as u16).to_le_bytes())?;
        self.inner
            .write_all(&(self.entries.len() as u16).to_le_bytes())?;
        self.inner.write_all(&central_size.to_le_bytes())?;
        self.inner.write_all(&central_start.to_le_bytes())?;
        self.inner.write_all(&0u16.to_le_bytes())?; // comment length

        self.inner.flush()?;
        Ok(self.inner)
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;

    #[test]
    fn npy_header_is_bit_exact() {
        let cursor = Cursor::new(Vec::new());
        let mut writer = NpyWriter::new(cursor, "<f4", 1).unwrap();
        writer.append_f32(&[1.0, 2.5, -3.0]).unwrap();
        let data = writer.finalize().unwrap().into_inner();

        assert_eq!(&data[..8], NPY_MAGIC);
        let header_size = u16::from_le_bytes([data[8], data[9]]) as usize;
        assert_eq!((10 + header_size) % NPY_ALIGN, 0);

        let dict = std::str::from_utf8(&data[10..10 + header_size]).unwrap();
        assert!(dict.starts_with("{'descr': '<f4', 'fortran_order': False, 'shape': (3,), }"));
        assert!(dict.ends_with('\n'));

        let payload = &data[10 + header_size..];
        assert_eq!(payload.len(), 12);
        assert_eq!(f32::from_le_bytes(payload[..4].try_into().unwrap()), 1.0);
        assert_eq!(f32::from_le_bytes(payload[8..].try_into().unwrap()), -3.0);
    }

    #[test]
    fn npy_two_columns_shape() {
        let cursor = Cursor::new(Vec::new());
        let mut writer = NpyWriter::new(cursor, "<f4", 2).unwrap();
        writer.append_f32_row(&[1.0, 2.0]).unwrap();
        writer.append_f32_row(&[3.0, 4.0]).unwrap();
        let data = writer.finalize().unwrap().into_inner();

        let header_size = u16::from_le_bytes([data[8], data[9]]) as usize;
        let dict = std::str::from_utf8(&data[10..10 + header_size]).unwrap();
        assert!(dict.contains("'shape': (2, 2)"));
    }

    #[test]
    fn crc32_matches_known_vector() {
        // standard test vector for CRC-32/ISO-HDLC
        assert_eq!(crc32(b"123456789"), 0xcbf43926);
        assert_eq!(crc32(b""), 0);
    }

    #[test]
    fn zip_layout_is_parseable() {
        let mut zip = ZipWriter::new(Cursor::new(Vec::new()));
        zip.add_file("a.npy", b"AAAA").unwrap();
        zip.add_file("b.npy", b"BBBBBB").unwrap();
        let data = zip.finish().unwrap().into_inner();

        // local header magics at the recorded offsets
        assert_eq!(&data[..4], &0x04034b50u32.to_le_bytes());
        let second = 30 + "a.npy".len() + 4;
        assert_eq!(&data[second..second + 4], &0x04034b50u32.to_le_bytes());

        // end-of-central-directory trailer
        let eocd = data.len() - 22;
        assert_eq!(&data[eocd..eocd + 4], &0x06054b50u32.to_le_bytes());
        let entries = u16::from_le_bytes([data[eocd + 10], data[eocd + 11]]);
        assert_eq!(entries, 2);
    }
}
