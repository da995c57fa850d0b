// Binary read/write helpers shared by every vmap file type

use std::fs::File;
use std::io::{BufReader, Read, Write};
use std::path::Path;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::error::{Result, VmapError};
use crate::math::Vec3;
use crate::{VMAP_MAGIC, VMAP_VERSION};

/// Open a vmap file, mapping a missing file to `VmapError::NotFound`
pub fn open_file(path: &Path) -> Result<BufReader<File>> {
    match File::open(path) {
        Ok(file) => Ok(BufReader::new(file)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            Err(VmapError::NotFound(path.to_path_buf()))
        }
        Err(e) => Err(e.into()),
    }
}

/// Check the 8 byte file header: 4 bytes magic followed by 4 bytes version
pub fn read_header<R: Read>(reader: &mut R) -> Result<()> {
    let mut header = [0u8; 8];
    reader.read_exact(&mut header)?;

    if &header[..4] != VMAP_MAGIC {
        return Err(VmapError::BadMagic {
            expected: String::from_utf8_lossy(VMAP_MAGIC).to_string(),
            found: String::from_utf8_lossy(&header[..4]).to_string(),
        });
    }
    if &header[4..] != VMAP_VERSION {
        return Err(VmapError::VersionMismatch {
            expected: String::from_utf8_lossy(VMAP_VERSION).to_string(),
            found: String::from_utf8_lossy(&header[4..]).to_string(),
        });
    }
    Ok(())
}

pub fn write_header<W: Write>(writer: &mut W) -> Result<()> {
    writer.write_all(VMAP_MAGIC)?;
    writer.write_all(VMAP_VERSION)?;
    Ok(())
}

pub fn read_chunk<R: Read>(reader: &mut R, expected: &[u8; 4]) -> Result<()> {
    let mut chunk = [0u8; 4];
    reader.read_exact(&mut chunk)?;
    if &chunk != expected {
        return Err(VmapError::ChunkMismatch {
            expected: String::from_utf8_lossy(expected).to_string(),
            found: String::from_utf8_lossy(&chunk).to_string(),
        });
    }
    Ok(())
}

/// Like `read_chunk` but reports a clean end of file as `Ok(false)`
pub fn read_optional_chunk<R: Read>(reader: &mut R, expected: &[u8; 4]) -> Result<bool> {
    let mut chunk = [0u8; 4];
    let mut filled = 0;
    while filled < chunk.len() {
        match reader.read(&mut chunk[filled..])? {
            0 if filled == 0 => return Ok(false),
            0 => {
                return Err(VmapError::Corrupt(format!(
                    "truncated chunk id (expected {:?})",
                    String::from_utf8_lossy(expected)
                )));
            }
            n => filled += n,
        }
    }
    if &chunk != expected {
        return Err(VmapError::ChunkMismatch {
            expected: String::from_utf8_lossy(expected).to_string(),
            found: String::from_utf8_lossy(&chunk).to_string(),
        });
    }
    Ok(true)
}

pub fn read_vec3<R: Read>(reader: &mut R) -> Result<Vec3> {
    let x = reader.read_f32::<LittleEndian>()?;
    let y = reader.read_f32::<LittleEndian>()?;
    let z = reader.read_f32::<LittleEndian>()?;
    Ok(Vec3::new(x, y, z))
}

pub fn write_vec3<W: Write>(writer: &mut W, v: Vec3) -> Result<()> {
    writer.write_f32::<LittleEndian>(v.x)?;
    writer.write_f32::<LittleEndian>(v.y)?;
    writer.write_f32::<LittleEndian>(v.z)?;
    Ok(())
}

/// Read an element count, rejecting values that cannot possibly fit in the file
pub fn read_count<R: Read>(reader: &mut R, limit: u32, what: &str) -> Result<usize> {
    let count = reader.read_u32::<LittleEndian>()?;
    if count > limit {
        return Err(VmapError::Corrupt(format!("{} count too large: {}", what, count)));
    }
    Ok(count as usize)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_header_checks() {
        let mut ok = Vec::new();
        write_header(&mut ok).unwrap();
        assert!(read_header(&mut Cursor::new(&ok)).is_ok());

        let err = read_header(&mut Cursor::new(b"VMAP_4.0")).unwrap_err();
        assert!(matches!(err, VmapError::VersionMismatch { .. }));

        let err = read_header(&mut Cursor::new(b"MMAP_7.0")).unwrap_err();
        assert!(matches!(err, VmapError::BadMagic { .. }));

        let err = read_header(&mut Cursor::new(b"VMA")).unwrap_err();
        assert!(matches!(err, VmapError::Io(_)));
    }

    #[test]
    fn test_optional_chunk() {
        assert!(!read_optional_chunk(&mut Cursor::new(Vec::<u8>::new()), b"GMOD").unwrap());
        assert!(read_optional_chunk(&mut Cursor::new(b"GMOD".to_vec()), b"GMOD").unwrap());
        assert!(read_optional_chunk(&mut Cursor::new(b"GM".to_vec()), b"GMOD").is_err());
        assert!(read_optional_chunk(&mut Cursor::new(b"GBIH".to_vec()), b"GMOD").is_err());
    }

    #[test]
    fn test_missing_file() {
        let err = open_file(Path::new("/nonexistent/000.vmtree")).unwrap_err();
        assert!(matches!(err, VmapError::NotFound(_)));
    }
}
