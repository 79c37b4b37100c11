//! Input-file readers: plumbing around the core that turns an external
//! file into a sorted `Vec<Record>` for [`crate::btree::BTree::bulk_load`].
//! Only the plain binary format is implemented; NPY and FVECS readers are
//! out-of-scope collaborators per the interface boundary.

use crate::btree::Record;
use crate::error::{BptError, BptResult};
use std::io::Read;
use std::path::Path;

/// Reads the sorted binary point format: `num_points: i32`,
/// `dimension: i32`, then `num_points * dimension` little-endian `f32`s.
/// The key for each point is its first coordinate, truncated to `i32` —
/// exactly `build_index_from_binary.cpp`'s convention, which relies on
/// the input already being sorted by that same first coordinate.
pub fn read_binary_points(path: impl AsRef<Path>) -> BptResult<Vec<Record>> {
    let mut file = std::fs::File::open(path)?;
    let mut header = [0u8; 8];
    file.read_exact(&mut header)?;
    let num_points = i32::from_le_bytes(header[0..4].try_into().unwrap());
    let dimension = i32::from_le_bytes(header[4..8].try_into().unwrap());

    if num_points < 0 || dimension <= 0 {
        return Err(BptError::BadConfig(format!(
            "invalid binary header: num_points={}, dimension={}",
            num_points, dimension
        )));
    }

    let mut records = Vec::with_capacity(num_points as usize);
    let mut point_buf = vec![0u8; dimension as usize * 4];
    for i in 0..num_points {
        if file.read_exact(&mut point_buf).is_err() {
            return Err(BptError::CorruptPage {
                page_id: i as u32,
                reason: "binary input file truncated before declared point count".into(),
            });
        }
        let vector: Vec<f32> = point_buf
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes(c.try_into().unwrap()))
            .collect();
        let key = vector[0] as i32;
        records.push(Record { key, vector });
    }
    Ok(records)
}

/// Writes the same binary format `read_binary_points` reads, used by
/// tests and by the CLI's synthetic-data subcommand to produce input
/// files round-tripping through the reader.
pub fn write_binary_points(path: impl AsRef<Path>, records: &[Record]) -> BptResult<()> {
    use std::io::Write;
    let dimension = records.first().map(|r| r.vector.len()).unwrap_or(0);
    let mut file = std::fs::File::create(path)?;
    file.write_all(&(records.len() as i32).to_le_bytes())?;
    file.write_all(&(dimension as i32).to_le_bytes())?;
    for r in records {
        for f in &r.vector {
            file.write_all(&f.to_le_bytes())?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn binary_format_roundtrips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("points.bin");
        let records: Vec<Record> = (0..10)
            .map(|i| Record {
                key: i,
                vector: vec![i as f32, (i * 2) as f32],
            })
            .collect();
        write_binary_points(&path, &records).unwrap();

        let read_back = read_binary_points(&path).unwrap();
        assert_eq!(read_back, records);
    }

    #[test]
    fn truncated_file_reports_corrupt_page() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.bin");
        std::fs::write(&path, [2i32.to_le_bytes(), 3i32.to_le_bytes()].concat()).unwrap();
        assert!(matches!(
            read_binary_points(&path),
            Err(BptError::CorruptPage { .. })
        ));
    }
}
